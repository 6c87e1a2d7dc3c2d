//! # mdir Codec
//!
//! Header documents and their two encodings.
//!
//! A header is an ordered list of `name: value` fields. It is what every
//! journal entry carries: a mail message, a file entry, a sub-folder link,
//! a mark pointing at an older version, and so on.
//!
//! - The **text form** is used on the wire and in `.put` staging files.
//! - The **CBOR form** is used inside journal records.
//!
//! ## Usage
//!
//! ```
//! use mdir_codec::{decode_text, encode_text, DocType, Header};
//!
//! let header = Header::directory("inbox");
//! let text = encode_text(&header).unwrap();
//! assert_eq!(text, "type: dir\nname: inbox\n");
//!
//! let decoded = decode_text(&text).unwrap();
//! assert_eq!(decoded.doc_type(), DocType::Directory);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod header;
mod text;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use header::{
    DocType, Header, FIELD_ALLOW, FIELD_DIGEST, FIELD_DIR_ID, FIELD_NAME, FIELD_RESOURCE,
    FIELD_TARGET, FIELD_TYPE,
};
pub use text::{
    decode_field_line, decode_text, encode_field_line, encode_text, escape, unescape,
    validate_name,
};

/// Types that can be stored as CBOR.
pub trait Encode {
    /// Encode this value to CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Types that can be loaded from CBOR.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Header {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl Decode for Header {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_roundtrip() {
        let header = Header::file("report.pdf", "abc", "res-1");
        let bytes = header.encode().unwrap();
        assert_eq!(Header::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn text_and_cbor_agree() {
        let header = Header::new().with("subject", "multi\nline").with("to", "x");
        let via_text = decode_text(&encode_text(&header).unwrap()).unwrap();
        let via_cbor = Header::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(via_text, via_cbor);
    }
}
