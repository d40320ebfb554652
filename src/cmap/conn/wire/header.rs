use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The wire protocol op codes this driver understands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
    Compressed = 2012,
    Message = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Message),
            other => Err(Error::invalid_response(format!(
                "Invalid wire protocol opcode: {}",
                other
            ))),
        }
    }
}

/// The fixed 16-byte prefix of every wire protocol message: four little-endian i32s.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 16;

    fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0u8; Self::LENGTH];
        for (chunk, value) in bytes.chunks_exact_mut(4).zip([
            self.length,
            self.request_id,
            self.response_to,
            self.op_code as i32,
        ]) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    fn from_bytes(bytes: [u8; Self::LENGTH]) -> Result<Self> {
        let field = |i: usize| i32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());

        Ok(Self {
            length: field(0),
            request_id: field(1),
            response_to: field(2),
            op_code: OpCode::try_from(field(3))?,
        })
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.to_bytes()).await?;
        Ok(())
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; Self::LENGTH];
        reader.read_exact(&mut bytes).await?;
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let header = Header {
            length: 1234,
            request_id: 7,
            response_to: 42,
            op_code: OpCode::Message,
        };

        let parsed = Header::from_bytes(header.to_bytes()).unwrap();
        assert_eq!(parsed.length, 1234);
        assert_eq!(parsed.request_id, 7);
        assert_eq!(parsed.response_to, 42);
        assert_eq!(parsed.op_code, OpCode::Message);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(OpCode::try_from(9999).is_err());
        assert_eq!(OpCode::try_from(2004).unwrap(), OpCode::Query);
    }
}
