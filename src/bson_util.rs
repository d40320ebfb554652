use crate::{
    bson::{Bson, Document},
    error::{ErrorKind, Result},
};

/// Coerces numeric types into an `i64` if it can be done without loss of precision.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerces numeric types into a `u64` if it can be done without loss of precision.
pub(crate) fn get_u64(val: &Bson) -> Option<u64> {
    get_int(val).and_then(|i| u64::try_from(i).ok())
}

/// The name of the command a document represents, i.e. its first key.
pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

pub(crate) fn replacement_document_check(replacement: &Document) -> Result<()> {
    match first_key(replacement) {
        Some(key) if !key.starts_with('$') => Ok(()),
        _ => Err(ErrorKind::InvalidArgument {
            message: "replacement document must have first key not starting with '$'".to_string(),
        }
        .into()),
    }
}

pub(crate) fn update_document_check(update: &Document) -> Result<()> {
    match first_key(update) {
        Some(key) if key.starts_with('$') => Ok(()),
        _ => Err(ErrorKind::InvalidArgument {
            message: "update document must have first key starting with '$'".to_string(),
        }
        .into()),
    }
}

/// The serialized length of a document.
pub(crate) fn doc_size_bytes(doc: &Document) -> Result<usize> {
    Ok(bson::to_vec(doc)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn int_coercion() {
        assert_eq!(get_int(&Bson::Int32(42)), Some(42));
        assert_eq!(get_int(&Bson::Int64(42)), Some(42));
        assert_eq!(get_int(&Bson::Double(1.0)), Some(1));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::String("1".to_string())), None);
        assert_eq!(get_u64(&Bson::Int32(-1)), None);
    }

    #[test]
    fn update_checks() {
        assert!(update_document_check(&doc! { "$set": { "x": 1 } }).is_ok());
        assert!(update_document_check(&doc! { "x": 1 }).is_err());
        assert!(replacement_document_check(&doc! { "x": 1 }).is_ok());
        assert!(replacement_document_check(&doc! { "$set": { "x": 1 } }).is_err());
    }
}
