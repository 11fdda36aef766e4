//! Gzip Member Header Parsing
//!
//! Only the pieces the block pipeline needs: validating that a stream
//! starts with a well-formed gzip member header and computing where the
//! DEFLATE data begins. Metadata (name, comment, mtime) is skipped, not
//! preserved.

use crate::error::{PargzError, PargzResult};

pub const MAGIC_ID1: u8 = 0x1f;
pub const MAGIC_ID2: u8 = 0x8b;
/// CM field: only DEFLATE (8) exists in practice.
pub const METHOD_DEFLATE: u8 = 0x08;

pub const FLAG_TEXT: u8 = 0x01;
pub const FLAG_HCRC: u8 = 0x02;
pub const FLAG_EXTRA: u8 = 0x04;
pub const FLAG_NAME: u8 = 0x08;
pub const FLAG_COMMENT: u8 = 0x10;
/// FLG bits 5-7 are reserved and must be zero.
pub const FLAG_RESERVED: u8 = 0xe0;

/// Fixed part of the member header: ID1 ID2 CM FLG MTIME XFL OS.
pub const FIXED_HEADER_SIZE: usize = 10;

/// Size of the CRC32 + ISIZE member trailer.
pub const FOOTER_SIZE: usize = 8;

/// Parse a gzip member header at the start of `prefix` and return its
/// length in bytes, i.e. the byte offset of the first DEFLATE block.
///
/// `prefix` does not need to hold the whole stream, only enough bytes to
/// cover the header (optional name/comment fields make it variable-sized).
pub fn parse_header(prefix: &[u8]) -> PargzResult<usize> {
    if prefix.len() < FIXED_HEADER_SIZE {
        return Err(PargzError::invalid_header("truncated fixed header"));
    }
    if prefix[0] != MAGIC_ID1 || prefix[1] != MAGIC_ID2 {
        return Err(PargzError::invalid_header("missing gzip magic bytes"));
    }
    if prefix[2] != METHOD_DEFLATE {
        return Err(PargzError::invalid_header(format!(
            "unsupported compression method {}",
            prefix[2]
        )));
    }

    let flags = prefix[3];
    if flags & FLAG_RESERVED != 0 {
        return Err(PargzError::invalid_header("reserved flag bits set"));
    }

    let mut offset = FIXED_HEADER_SIZE;

    if flags & FLAG_EXTRA != 0 {
        if offset + 2 > prefix.len() {
            return Err(PargzError::invalid_header("truncated FEXTRA length"));
        }
        let xlen = u16::from_le_bytes([prefix[offset], prefix[offset + 1]]) as usize;
        offset += 2 + xlen;
        if offset > prefix.len() {
            return Err(PargzError::invalid_header("truncated FEXTRA field"));
        }
    }

    if flags & FLAG_NAME != 0 {
        offset = skip_zero_terminated(prefix, offset)
            .ok_or_else(|| PargzError::invalid_header("unterminated FNAME"))?;
    }

    if flags & FLAG_COMMENT != 0 {
        offset = skip_zero_terminated(prefix, offset)
            .ok_or_else(|| PargzError::invalid_header("unterminated FCOMMENT"))?;
    }

    if flags & FLAG_HCRC != 0 {
        offset += 2;
        if offset > prefix.len() {
            return Err(PargzError::invalid_header("truncated FHCRC"));
        }
    }

    Ok(offset)
}

fn skip_zero_terminated(data: &[u8], mut offset: usize) -> Option<usize> {
    while offset < data.len() {
        if data[offset] == 0 {
            return Some(offset + 1);
        }
        offset += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_header() {
        let header = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
        assert_eq!(parse_header(&header).unwrap(), 10);
    }

    #[test]
    fn test_parse_header_with_name() {
        let mut data = vec![0x1f, 0x8b, 0x08, FLAG_NAME, 0, 0, 0, 0, 0x00, 0xff];
        data.extend_from_slice(b"file.txt\0");
        data.extend_from_slice(&[0xde, 0xad]); // start of deflate data
        assert_eq!(parse_header(&data).unwrap(), 10 + 9);
    }

    #[test]
    fn test_parse_header_with_extra_field() {
        let mut data = vec![0x1f, 0x8b, 0x08, FLAG_EXTRA, 0, 0, 0, 0, 0x00, 0xff];
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(parse_header(&data).unwrap(), 10 + 2 + 4);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let header = [0x1f, 0x8c, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
        assert!(matches!(
            parse_header(&header),
            Err(PargzError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_rejects_reserved_flags() {
        let header = [0x1f, 0x8b, 0x08, 0x20, 0, 0, 0, 0, 0x00, 0xff];
        assert!(parse_header(&header).is_err());
    }

    #[test]
    fn test_rejects_truncated() {
        assert!(parse_header(&[0x1f, 0x8b, 0x08]).is_err());

        let mut data = vec![0x1f, 0x8b, 0x08, FLAG_NAME, 0, 0, 0, 0, 0x00, 0xff];
        data.extend_from_slice(b"never-terminated");
        assert!(parse_header(&data).is_err());
    }

    #[test]
    fn test_parses_flate2_output() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let header_size = parse_header(&compressed).unwrap();
        assert!(header_size >= FIXED_HEADER_SIZE);
        assert!(header_size < compressed.len());
    }
}
