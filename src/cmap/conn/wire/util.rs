use rand::Rng;

/// Returns a request id for a wire message: a positive 31-bit random value chosen per message.
pub(crate) fn next_request_id() -> i32 {
    rand::thread_rng().gen_range(1..=i32::MAX)
}

/// Reads a null-terminated string from the front of `bytes`, returning the string and the
/// remainder.
pub(super) fn read_cstring(bytes: &[u8]) -> crate::error::Result<(&str, &[u8])> {
    let nul = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| crate::error::Error::invalid_response("unterminated cstring in message"))?;
    let s = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| crate::error::Error::invalid_response("non-UTF-8 cstring in message"))?;
    Ok((s, &bytes[nul + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_positive() {
        for _ in 0..1000 {
            assert!(next_request_id() > 0);
        }
    }

    #[test]
    fn cstring_parsing() {
        let (s, rest) = read_cstring(b"documents\0abc").unwrap();
        assert_eq!(s, "documents");
        assert_eq!(rest, b"abc");
        assert!(read_cstring(b"no terminator").is_err());
    }
}
