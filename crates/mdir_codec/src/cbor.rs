//! CBOR form of a header, used inside journal records.
//!
//! A header is written as an array of `[name, value]` pairs so that field
//! order and duplicates survive.

use crate::error::{CodecError, CodecResult};
use crate::header::Header;

/// Encodes a header to CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::EncodingFailed`] if serialization fails.
pub fn to_cbor(header: &Header) -> CodecResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(header, &mut bytes)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a header from CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::DecodingFailed`] on malformed input.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Header> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn preserves_order_and_duplicates() {
        let header = Header::new()
            .with("to", "bob")
            .with("subject", "x")
            .with("to", "alice");
        let decoded = from_cbor(&to_cbor(&header).unwrap()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn empty_header() {
        let bytes = to_cbor(&Header::new()).unwrap();
        assert_eq!(bytes, vec![0x80]);
        assert!(from_cbor(&bytes).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            from_cbor(&[0xff, 0x00, 0x13]),
            Err(CodecError::DecodingFailed { .. })
        ));
        // a map is not a header
        assert!(from_cbor(&[0xa0]).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_headers(fields in prop::collection::vec((".*", ".*"), 0..6)) {
            let header: Header = fields.into_iter().collect();
            prop_assert_eq!(from_cbor(&to_cbor(&header).unwrap()).unwrap(), header);
        }
    }
}
