//! Journal record envelope.

use crate::error::{CoreError, CoreResult};
use mdir_codec::{from_cbor, to_cbor};
use mdir_protocol::{Action, Patch};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"MDJL";

/// Current journal record format.
pub const JOURNAL_FORMAT: u16 = 1;

/// magic (4) + format (2) + action (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// Fixed part of the payload: old and new version.
const VERSIONS_SIZE: usize = 16;

/// Serializes a patch into a complete, checksummed record.
///
/// # Errors
///
/// Fails if the document cannot be encoded or the payload does not fit the
/// 4-byte length field.
pub fn encode_record(patch: &Patch) -> CoreResult<Vec<u8>> {
    let document = to_cbor(&patch.header)?;
    let payload_len = u32::try_from(VERSIONS_SIZE + document.len())
        .map_err(|_| CoreError::invalid_argument("journal record payload too large"))?;

    let mut data =
        Vec::with_capacity(HEADER_SIZE + VERSIONS_SIZE + document.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_FORMAT.to_le_bytes());
    data.push(patch.action.to_byte());
    data.extend_from_slice(&payload_len.to_le_bytes());
    data.extend_from_slice(&patch.old_version.to_le_bytes());
    data.extend_from_slice(&patch.new_version.to_le_bytes());
    data.extend_from_slice(&document);

    // CRC32 over everything before it
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Parsed fixed header of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// What the record does.
    pub action: Action,
    /// Payload length in bytes.
    pub payload_len: usize,
}

impl RecordHeader {
    /// Total record length including envelope and checksum.
    #[must_use]
    pub fn record_len(&self) -> usize {
        HEADER_SIZE + self.payload_len + CRC_SIZE
    }

    /// Parses and validates the fixed header at `offset`.
    ///
    /// # Errors
    ///
    /// Bad magic, a future format or an unknown action byte are corruption.
    pub fn parse(bytes: &[u8], offset: u64) -> CoreResult<Self> {
        if bytes.len() < HEADER_SIZE || bytes[0..4] != JOURNAL_MAGIC {
            return Err(CoreError::journal_corruption(format!(
                "invalid magic at offset {offset}"
            )));
        }

        let format = u16::from_le_bytes([bytes[4], bytes[5]]);
        if format > JOURNAL_FORMAT {
            return Err(CoreError::journal_corruption(format!(
                "unsupported format {format} at offset {offset}"
            )));
        }

        let action = Action::from_byte(bytes[6]).ok_or_else(|| {
            CoreError::journal_corruption(format!(
                "unknown action {} at offset {offset}",
                bytes[6]
            ))
        })?;

        let payload_len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;
        Ok(Self {
            action,
            payload_len,
        })
    }
}

/// Verifies the checksum of a complete record and decodes its patch.
///
/// # Errors
///
/// Returns [`CoreError::ChecksumMismatch`] or a corruption error when the
/// payload does not decode into a valid patch.
pub fn decode_record(header: RecordHeader, record: &[u8]) -> CoreResult<Patch> {
    let body_end = HEADER_SIZE + header.payload_len;
    if record.len() != body_end + CRC_SIZE {
        return Err(CoreError::journal_corruption("record length mismatch"));
    }

    let stored = u32::from_le_bytes([
        record[body_end],
        record[body_end + 1],
        record[body_end + 2],
        record[body_end + 3],
    ]);
    let computed = compute_crc32(&record[..body_end]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    let payload = &record[HEADER_SIZE..body_end];
    if payload.len() < VERSIONS_SIZE {
        return Err(CoreError::journal_corruption("payload shorter than versions"));
    }
    let read_i64 = |at: usize| -> CoreResult<i64> {
        let bytes: [u8; 8] = payload[at..at + 8]
            .try_into()
            .map_err(|_| CoreError::journal_corruption("invalid version"))?;
        Ok(i64::from_le_bytes(bytes))
    };
    let old_version = read_i64(0)?;
    let new_version = read_i64(8)?;
    let document = from_cbor(&payload[VERSIONS_SIZE..])?;

    Patch::new(old_version, new_version, header.action, document)
        .map_err(|e| CoreError::journal_corruption(e.to_string()))
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, table built at compile time
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
