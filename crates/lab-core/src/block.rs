//! IEEE 488.2 definite-length arbitrary block data.
//!
//! ```text
//! #<n><length: n ASCII digits><payload: length bytes>
//! #42500<2500 bytes>
//! ```
//!
//! Oscilloscopes return waveforms this way (`CURV?`), and arbitrary
//! waveform generators accept them. Indefinite blocks (`#0 ... \n`) are not
//! supported; every instrument in the catalogue emits definite blocks.

use crate::error::{LabError, Result};
use crate::limits::MAX_BLOCK_BYTES;

/// Parsed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Bytes occupied by the header itself (`#`, digit count, digits).
    pub header_len: usize,
    pub payload_len: usize,
}

/// Parse a header from the start of `data`.
///
/// Returns `Ok(None)` if more bytes are needed to decide.
pub fn parse_header(data: &[u8]) -> Result<Option<BlockHeader>> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    if first != b'#' {
        return Err(malformed(data, "missing '#'"));
    }
    let Some(&count) = data.get(1) else {
        return Ok(None);
    };
    if count == b'0' {
        return Err(malformed(data, "indefinite-length blocks are not supported"));
    }
    if !count.is_ascii_digit() {
        return Err(malformed(data, "length digit count is not a digit"));
    }
    let digits = usize::from(count - b'0');
    let Some(length_field) = data.get(2..2 + digits) else {
        return Ok(None);
    };
    let length_str =
        std::str::from_utf8(length_field).map_err(|_| malformed(data, "length not ASCII"))?;
    let payload_len: usize = length_str
        .parse()
        .map_err(|_| malformed(data, "length not numeric"))?;
    if payload_len > MAX_BLOCK_BYTES {
        return Err(malformed(
            data,
            &format!("payload of {payload_len} bytes exceeds {MAX_BLOCK_BYTES}"),
        ));
    }
    Ok(Some(BlockHeader {
        header_len: 2 + digits,
        payload_len,
    }))
}

/// Extract the payload of a complete block (trailing terminator ignored).
pub fn parse_block(data: &[u8]) -> Result<&[u8]> {
    let header = parse_header(data)?.ok_or_else(|| malformed(data, "truncated header"))?;
    let end = header.header_len + header.payload_len;
    data.get(header.header_len..end)
        .ok_or_else(|| malformed(data, "truncated payload"))
}

/// Frame `payload` as a definite-length block.
pub fn encode_block(payload: &[u8]) -> Vec<u8> {
    let len = payload.len().to_string();
    let mut out = Vec::with_capacity(2 + len.len() + payload.len());
    out.push(b'#');
    out.extend_from_slice(len.len().to_string().as_bytes());
    out.extend_from_slice(len.as_bytes());
    out.extend_from_slice(payload);
    out
}

fn malformed(data: &[u8], reason: &str) -> LabError {
    let preview: String = String::from_utf8_lossy(&data[..data.len().min(16)]).into_owned();
    LabError::parse("block", "", preview, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scope_curve_reply() {
        let mut reply = b"#15".to_vec();
        reply.extend_from_slice(&[0x00, 0x7f, 0x80, 0xff, 0x01]);
        reply.push(b'\n');

        let header = parse_header(&reply).unwrap().unwrap();
        assert_eq!(header.header_len, 3);
        assert_eq!(header.payload_len, 5);
        assert_eq!(parse_block(&reply).unwrap(), &[0x00, 0x7f, 0x80, 0xff, 0x01]);
    }

    #[test]
    fn multi_digit_length() {
        let payload = vec![0xAAu8; 2500];
        let block = encode_block(&payload);
        assert_eq!(&block[..6], b"#42500");
        assert_eq!(parse_block(&block).unwrap().len(), 2500);
    }

    #[test]
    fn incomplete_header_needs_more() {
        assert_eq!(parse_header(b"").unwrap(), None);
        assert_eq!(parse_header(b"#").unwrap(), None);
        assert_eq!(parse_header(b"#42").unwrap(), None);
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_header(b"42500").is_err());
        assert!(parse_header(b"#0\x01\x02\n").is_err());
        assert!(parse_header(b"#x123").is_err());
        assert!(parse_block(b"#210abc").is_err());
    }
}
