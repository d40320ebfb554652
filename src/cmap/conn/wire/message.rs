use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{
    bson::{Bson, Document},
    cmap::conn::command::Command,
    compression::{self, Compressor},
    error::{Error, ErrorKind, Result},
};

/// The default maximum size for a wire message, used until the server has reported its own limit
/// in the handshake.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Array-valued write command fields that are lifted out of the command body and sent as
/// payload-type-1 document sequences.
const SEQUENCE_FIELDS: &[&str] = &["documents", "updates", "deletes"];

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A payload-type-1 section: a run of documents sent under a single identifier.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

/// Represents an OP_MSG wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. Array-valued write fields (`documents`,
    /// `updates`, `deletes`) are lifted into document sequences, leaving the command header in
    /// the single-document section.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Result<Self> {
        let mut body = command.body;
        body.insert("$db", command.target_db);

        let mut document_sequences = Vec::new();
        for field in SEQUENCE_FIELDS {
            if matches!(body.get(*field), Some(Bson::Array(_))) {
                if let Some(Bson::Array(array)) = body.remove(*field) {
                    let documents = array
                        .into_iter()
                        .map(|entry| match entry {
                            Bson::Document(doc) => Ok(doc),
                            other => Err(Error::invalid_argument(format!(
                                "all entries in the {} array must be documents, got {:?}",
                                field, other
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    document_sequences.push(DocumentSequence {
                        identifier: field.to_string(),
                        documents,
                    });
                }
            }
        }

        Ok(Self {
            response_to: 0,
            flags: MessageFlags::empty(),
            document_payload: body,
            document_sequences,
            checksum: None,
            request_id,
        })
    }

    /// The full command document, with any document sequences folded back into the body. Used
    /// for command monitoring events.
    pub(crate) fn get_command_document(&self) -> Document {
        let mut doc = self.document_payload.clone();
        for sequence in &self.document_sequences {
            let array: Vec<Bson> = sequence
                .documents
                .iter()
                .cloned()
                .map(Bson::Document)
                .collect();
            doc.insert(sequence.identifier.clone(), array);
        }
        doc
    }

    /// Consumes the message, yielding the single result document of a reply.
    pub(crate) fn into_single_document_response(self) -> Document {
        self.document_payload
    }

    /// Reads bytes from `reader` and deserializes them into a Message, decompressing as needed.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);

        if header.length < Header::LENGTH as i32 || header.length > max_len {
            return Err(Error::invalid_response(format!(
                "reply declares a length of {} bytes, which is outside the valid range [{}, {}]",
                header.length,
                Header::LENGTH,
                max_len,
            )));
        }

        let mut body = vec![0u8; (header.length as usize) - Header::LENGTH];
        reader.read_exact(&mut body).await?;

        match header.op_code {
            OpCode::Message => Self::parse_op_msg(&header, &body),
            OpCode::Reply => Self::parse_op_reply(&header, &body),
            OpCode::Compressed => Self::parse_op_compressed(&header, &body),
            OpCode::Query => Err(Error::invalid_response(
                "server sent an OP_QUERY message, which is only valid as a request",
            )),
        }
    }

    fn parse_op_msg(header: &Header, body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::invalid_response("OP_MSG reply is missing flag bits"));
        }
        let flags =
            MessageFlags::from_bits_truncate(u32::from_le_bytes(body[0..4].try_into().unwrap()));

        let mut remaining = &body[4..];
        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };

        let mut document_payload: Option<Document> = None;
        let mut document_sequences = Vec::new();

        while remaining.len() > checksum_len {
            let payload_type = remaining[0];
            remaining = &remaining[1..];

            match payload_type {
                0 => {
                    let (doc, rest) = read_document(remaining)?;
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "reply contained multiple payload-type-0 sections",
                        ));
                    }
                    document_payload = Some(doc);
                    remaining = rest;
                }
                1 => {
                    if remaining.len() < 4 {
                        return Err(Error::invalid_response("truncated document sequence"));
                    }
                    let size =
                        i32::from_le_bytes(remaining[0..4].try_into().unwrap()) as usize;
                    if size < 4 || size > remaining.len() {
                        return Err(Error::invalid_response(
                            "document sequence length out of bounds",
                        ));
                    }
                    let (sequence_bytes, rest) = remaining.split_at(size);
                    let (identifier, mut docs_bytes) = util::read_cstring(&sequence_bytes[4..])?;

                    let mut documents = Vec::new();
                    while !docs_bytes.is_empty() {
                        let (doc, rest) = read_document(docs_bytes)?;
                        documents.push(doc);
                        docs_bytes = rest;
                    }

                    document_sequences.push(DocumentSequence {
                        identifier: identifier.to_string(),
                        documents,
                    });
                    remaining = rest;
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "reply contained unknown payload type {}",
                        other
                    )))
                }
            }
        }

        if remaining.len() != checksum_len {
            return Err(Error::invalid_response(format!(
                "the server indicated that the reply would be {} bytes long, but the sections did \
                 not line up with that length",
                header.length,
            )));
        }

        let checksum = if checksum_len == 4 {
            Some(u32::from_le_bytes(remaining[0..4].try_into().unwrap()))
        } else {
            None
        };

        let document_payload = document_payload
            .ok_or_else(|| Error::invalid_response("no response document received from server"))?;

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload,
            document_sequences,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Parses the body of an OP_REPLY message, as received in response to the OP_QUERY
    /// pre-handshake hello.
    fn parse_op_reply(header: &Header, body: &[u8]) -> Result<Self> {
        // responseFlags, cursorId, startingFrom, numberReturned
        const REPLY_PREFIX: usize = 4 + 8 + 4 + 4;
        if body.len() < REPLY_PREFIX {
            return Err(Error::invalid_response("truncated OP_REPLY message"));
        }

        let number_returned = i32::from_le_bytes(body[16..20].try_into().unwrap());
        if number_returned < 1 {
            return Err(Error::invalid_response(
                "OP_REPLY contained no response document",
            ));
        }

        let (document_payload, _) = read_document(&body[REPLY_PREFIX..])?;

        Ok(Self {
            response_to: header.response_to,
            flags: MessageFlags::empty(),
            document_payload,
            document_sequences: Vec::new(),
            checksum: None,
            request_id: Some(header.request_id),
        })
    }

    fn parse_op_compressed(header: &Header, body: &[u8]) -> Result<Self> {
        // originalOpcode, uncompressedSize, compressorId
        if body.len() < 9 {
            return Err(Error::invalid_response("truncated OP_COMPRESSED message"));
        }
        let original_opcode =
            OpCode::try_from(i32::from_le_bytes(body[0..4].try_into().unwrap()))?;
        let uncompressed_size = i32::from_le_bytes(body[4..8].try_into().unwrap());
        let compressor_id = body[8];

        let decompressed = compression::decompress(compressor_id, &body[9..])?;

        if decompressed.len() != uncompressed_size as usize {
            return Err(Error::invalid_response(format!(
                "declared uncompressed size {} does not match actual decompressed length {}",
                uncompressed_size,
                decompressed.len(),
            )));
        }

        let inner_header = Header {
            length: (decompressed.len() + Header::LENGTH) as i32,
            request_id: header.request_id,
            response_to: header.response_to,
            op_code: original_opcode,
        };

        match original_opcode {
            OpCode::Message => Self::parse_op_msg(&inner_header, &decompressed),
            OpCode::Reply => Self::parse_op_reply(&inner_header, &decompressed),
            _ => Err(Error::invalid_response(
                "OP_COMPRESSED must wrap OP_MSG or OP_REPLY",
            )),
        }
    }

    /// Serializes the flags and sections of this message, i.e. everything after the header.
    fn sections_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();

        bytes.extend(self.flags.bits().to_le_bytes());

        bytes.push(0u8);
        bytes.extend(bson::to_vec(&self.document_payload)?);

        for sequence in &self.document_sequences {
            bytes.push(1u8);

            let mut section = Vec::new();
            section.extend(sequence.identifier.as_bytes());
            section.push(0u8);
            for doc in &sequence.documents {
                section.extend(bson::to_vec(doc)?);
            }

            let size = (section.len() + 4) as i32;
            bytes.extend(size.to_le_bytes());
            bytes.extend(section);
        }

        if let Some(checksum) = self.checksum {
            bytes.extend(checksum.to_le_bytes());
        }

        Ok(bytes)
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let sections = self.sections_bytes()?;

        let header = Header {
            length: (Header::LENGTH + sections.len()) as i32,
            request_id: self.request_id.unwrap_or_else(super::util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&sections).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Serializes the Message, compresses it with the given compressor, and writes it to `writer`
    /// wrapped in an OP_COMPRESSED envelope.
    pub(crate) async fn write_compressed_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        compressor: &Compressor,
    ) -> Result<()> {
        let sections = self.sections_bytes()?;
        let compressed = compressor.compress(&sections)?;

        let total_length = Header::LENGTH + 4 + 4 + 1 + compressed.len();

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(super::util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_all(&(OpCode::Message as i32).to_le_bytes())
            .await?;
        writer
            .write_all(&(sections.len() as i32).to_le_bytes())
            .await?;
        writer.write_all(&[compressor.id()]).await?;
        writer.write_all(&compressed).await?;
        writer.flush().await?;

        Ok(())
    }
}

/// Writes a legacy OP_QUERY against `admin.$cmd`, used only for the pre-handshake hello on
/// connections that have not yet negotiated a wire version.
pub(crate) async fn write_op_query_to<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: i32,
    query: &Document,
) -> Result<()> {
    const FULL_COLLECTION_NAME: &[u8] = b"admin.$cmd\0";
    // The "slaveOk" wire flag, required so the handshake succeeds against secondaries.
    const QUERY_FLAGS: i32 = 1 << 2;

    let query_bytes = bson::to_vec(query)?;
    let length = Header::LENGTH + 4 + FULL_COLLECTION_NAME.len() + 4 + 4 + query_bytes.len();

    let header = Header {
        length: length as i32,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    };

    header.write_to(writer).await?;
    writer.write_all(&QUERY_FLAGS.to_le_bytes()).await?;
    writer.write_all(FULL_COLLECTION_NAME).await?;
    writer.write_all(&0i32.to_le_bytes()).await?; // numberToSkip
    writer.write_all(&(-1i32).to_le_bytes()).await?; // numberToReturn
    writer.write_all(&query_bytes).await?;
    writer.flush().await?;

    Ok(())
}

fn read_document(bytes: &[u8]) -> Result<(Document, &[u8])> {
    if bytes.len() < 4 {
        return Err(Error::invalid_response("truncated document in message"));
    }
    let len = i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if len < 5 || len > bytes.len() {
        return Err(Error::invalid_response(
            "document length out of bounds in message",
        ));
    }
    let doc = Document::from_reader(&mut &bytes[..len])
        .map_err(|e| Error::invalid_response(format!("malformed document in message: {}", e)))?;
    Ok((doc, &bytes[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::doc;

    fn insert_command() -> Command {
        Command::new(
            "insert",
            "test",
            doc! {
                "insert": "users",
                "documents": [ { "_id": 1 }, { "_id": 2 } ],
                "ordered": true,
            },
        )
    }

    async fn round_trip(message: &Message) -> Message {
        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();
        Message::read_from(&mut bytes.as_slice(), None).await.unwrap()
    }

    #[tokio::test]
    async fn document_sequence_lifting() {
        let message = Message::from_command(insert_command(), Some(7)).unwrap();

        assert!(!message.document_payload.contains_key("documents"));
        assert_eq!(message.document_sequences.len(), 1);
        assert_eq!(message.document_sequences[0].identifier, "documents");
        assert_eq!(message.document_sequences[0].documents.len(), 2);
        assert_eq!(
            message.document_payload.get_str("$db").unwrap(),
            "test"
        );

        // The monitoring view folds the sequence back in.
        let command_doc = message.get_command_document();
        assert_eq!(
            command_doc.get_array("documents").unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn op_msg_round_trip() {
        let message = Message::from_command(insert_command(), Some(42)).unwrap();
        let parsed = round_trip(&message).await;

        assert_eq!(parsed.document_payload, message.document_payload);
        assert_eq!(parsed.document_sequences, message.document_sequences);
        assert_eq!(parsed.request_id, Some(42));
    }

    #[tokio::test]
    async fn compressed_round_trip() {
        let message = Message::from_command(insert_command(), Some(13)).unwrap();

        for compressor in [
            Compressor::Snappy,
            Compressor::Zlib { level: None },
            Compressor::Zstd { level: None },
        ] {
            let mut bytes = Vec::new();
            message
                .write_compressed_to(&mut bytes, &compressor)
                .await
                .unwrap();
            let parsed = Message::read_from(&mut bytes.as_slice(), None).await.unwrap();

            assert_eq!(parsed.document_payload, message.document_payload);
            assert_eq!(parsed.document_sequences, message.document_sequences);
        }
    }

    #[tokio::test]
    async fn rejects_length_mismatch() {
        let message = Message::from_command(insert_command(), Some(1)).unwrap();
        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        // Truncating the payload while leaving the declared length alone must error.
        bytes.truncate(bytes.len() - 1);
        assert!(Message::read_from(&mut bytes.as_slice(), None).await.is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_declared_length() {
        let message = Message::from_command(insert_command(), Some(1)).unwrap();
        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        assert!(Message::read_from(&mut bytes.as_slice(), Some(16)).await.is_err());
    }

    #[tokio::test]
    async fn parses_op_reply() {
        let reply_doc = doc! { "ok": 1, "maxWireVersion": 17 };
        let doc_bytes = bson::to_vec(&reply_doc).unwrap();

        let mut bytes = Vec::new();
        let header = Header {
            length: (Header::LENGTH + 20 + doc_bytes.len()) as i32,
            request_id: 99,
            response_to: 12,
            op_code: OpCode::Reply,
        };
        header.write_to(&mut bytes).await.unwrap();
        bytes.extend(0i32.to_le_bytes()); // responseFlags
        bytes.extend(0i64.to_le_bytes()); // cursorId
        bytes.extend(0i32.to_le_bytes()); // startingFrom
        bytes.extend(1i32.to_le_bytes()); // numberReturned
        bytes.extend(doc_bytes);

        let parsed = Message::read_from(&mut bytes.as_slice(), None).await.unwrap();
        assert_eq!(parsed.response_to, 12);
        assert_eq!(parsed.into_single_document_response(), reply_doc);
    }
}
