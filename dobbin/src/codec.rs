//! Identifier codec (component A).
//!
//! Encodes cross-object references and embedded-stream references as opaque
//! tokens: `oid://<oid>[:<class>]` and `file://<offset>:<length>`. These
//! tokens are what actually gets written
//! to the transaction log for `Value::Ref` and `Value::Stream` (see
//! `value.rs`), so this module is the wire codec for those two variants,
//! not just a decorative layer on top of them.

use crate::error::Error;
use crate::oid::Oid;

/// A decoded reference token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefToken {
    Oid { oid: Oid, class: Option<String> },
    File { offset: u64, length: u64 },
}

/// Encodes an object reference. When `class` is known it is carried in the
/// payload so the decoder can construct a `Broken` placeholder of the right
/// concrete type even if the target hasn't been loaded yet; when unknown,
/// the decoder falls back to an in-memory lookup.
pub fn encode_oid_ref(oid: Oid, class: Option<&str>) -> String {
    match class {
        Some(class) => format!("oid://{oid}:{class}"),
        None => format!("oid://{oid}"),
    }
}

/// Encodes a reference to a byte range within the log file.
pub fn encode_file_ref(offset: u64, length: u64) -> String {
    format!("file://{offset}:{length}")
}

/// Decodes a reference token produced by `encode_oid_ref`/`encode_file_ref`.
/// Any other scheme is an integrity error.
pub fn decode_ref(token: &str) -> Result<RefToken, Error> {
    if let Some(rest) = token.strip_prefix("oid://") {
        return match rest.split_once(':') {
            Some((oid, class)) => {
                let oid = oid
                    .parse()
                    .map_err(|_| Error::Integrity(format!("malformed oid token: {token}")))?;
                Ok(RefToken::Oid { oid, class: Some(class.to_string()) })
            }
            None => {
                let oid = rest
                    .parse()
                    .map_err(|_| Error::Integrity(format!("malformed oid token: {token}")))?;
                Ok(RefToken::Oid { oid, class: None })
            }
        };
    }

    if let Some(rest) = token.strip_prefix("file://") {
        let (offset, length) = rest
            .split_once(':')
            .ok_or_else(|| Error::Integrity(format!("malformed file token: {token}")))?;
        let offset = offset
            .parse()
            .map_err(|_| Error::Integrity(format!("malformed file token: {token}")))?;
        let length = length
            .parse()
            .map_err(|_| Error::Integrity(format!("malformed file token: {token}")))?;
        return Ok(RefToken::File { offset, length });
    }

    Err(Error::Integrity(format!("unknown reference scheme: {token}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_round_trip_without_class() {
        let token = encode_oid_ref(42, None);
        assert_eq!(token, "oid://42");
        assert_eq!(decode_ref(&token).unwrap(), RefToken::Oid { oid: 42, class: None });
    }

    #[test]
    fn oid_round_trip_with_class() {
        let token = encode_oid_ref(7, Some("myapp::Account"));
        assert_eq!(decode_ref(&token).unwrap(), RefToken::Oid { oid: 7, class: Some("myapp::Account".into()) });
    }

    #[test]
    fn file_round_trip() {
        let token = encode_file_ref(1024, 2048);
        assert_eq!(token, "file://1024:2048");
        assert_eq!(decode_ref(&token).unwrap(), RefToken::File { offset: 1024, length: 2048 });
    }

    #[test]
    fn unknown_scheme_is_integrity_error() {
        let err = decode_ref("http://nope").unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn malformed_oid_is_integrity_error() {
        assert!(decode_ref("oid://not-a-number").is_err());
        assert!(decode_ref("file://only-one-part").is_err());
    }
}
