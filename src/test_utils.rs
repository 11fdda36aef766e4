//! Shared test fixtures: hand-assembled gzip/BGZF streams, deterministic
//! filler data, and a mock decoder for exercising the fetcher without real
//! DEFLATE work.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

use crate::block_decoder::BlockDecoder;
use crate::error::{PargzError, PargzResult};

#[macro_export]
macro_rules! assert_slices_eq {
    ($left:expr, $right:expr) => {
        let left = &$left[..];
        let right = &$right[..];
        if left != right {
            if left.len() != right.len() {
                panic!(
                    "assertion failed: `(left == right)`\n  left len: {},\n right len: {}",
                    left.len(),
                    right.len()
                );
            }
            for (i, (a, b)) in left.iter().zip(right.iter()).enumerate() {
                if a != b {
                    let start = i.saturating_sub(16);
                    let end = (i + 16).min(left.len());
                    panic!(
                        "assertion failed: `(left == right)` at index {}\n  left[{:?}]: {:02X?}\n right[{:?}]: {:02X?}\n context around index {}:\n left:  {:02X?}\n right: {:02X?}",
                        i, i, a, i, b, i, &left[start..end], &right[start..end]
                    );
                }
            }
        }
    };
}

/// The canonical 20-byte empty gzip member: fixed header, an empty final
/// fixed-Huffman block (`03 00`), zeroed CRC32 and ISIZE.
pub fn empty_gzip_member() -> Vec<u8> {
    let mut member = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
    member.extend_from_slice(&[0x03, 0x00]);
    member.extend_from_slice(&[0u8; 8]);
    member
}

/// A plain gzip member compressing `payload` (10-byte header, so the first
/// block offset is bit 80).
pub fn gzip_member(payload: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

/// A BGZF member: gzip header with the 6-byte "BC" extra subfield carrying
/// BSIZE (total member size - 1), raw DEFLATE payload, CRC32 + ISIZE
/// trailer. The header is always 18 bytes.
pub fn bgzf_member(payload: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    let deflate_data = encoder.finish().unwrap();

    let total_size = 18 + deflate_data.len() + 8;
    assert!(total_size <= u16::MAX as usize + 1, "BGZF member too large");
    let bsize = (total_size - 1) as u16;

    let mut crc = Crc::new();
    crc.update(payload);

    let mut member = vec![0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0x00, 0xff];
    member.extend_from_slice(&6u16.to_le_bytes()); // XLEN
    member.extend_from_slice(b"BC");
    member.extend_from_slice(&2u16.to_le_bytes()); // SLEN
    member.extend_from_slice(&bsize.to_le_bytes());
    member.extend_from_slice(&deflate_data);
    member.extend_from_slice(&crc.sum().to_le_bytes());
    member.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    member
}

/// Concatenated BGZF members, without the trailing EOF marker; append
/// [`BGZF_EOF_BLOCK`] for a fully standard file.
pub fn bgzf_file(payloads: &[&[u8]]) -> Vec<u8> {
    let mut file = Vec::new();
    for payload in payloads {
        file.extend_from_slice(&bgzf_member(payload));
    }
    file
}

/// The standard 28-byte BGZF end-of-file marker (an empty member).
pub const BGZF_EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43,
    0x02, 0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Deterministic incompressible bytes (xorshift64), so BGZF members can be
/// made reliably larger than the partition spacing.
pub fn incompressible(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).max(1);
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(len);
    data
}

/// Block type produced by [`MockDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBlock {
    pub block_offset: u64,
    pub next_block_offset: u64,
}

/// A decoder that fabricates blocks instead of inflating, recording how
/// often each offset was decoded. Offsets listed in `failing_offsets`
/// error; `latency` simulates decode time.
pub struct MockDecoder {
    latency: Duration,
    latency_at: HashMap<u64, Duration>,
    failing_offsets: HashSet<u64>,
    decode_counts: Mutex<HashMap<u64, usize>>,
}

impl MockDecoder {
    pub fn new() -> Self {
        MockDecoder {
            latency: Duration::ZERO,
            latency_at: HashMap::new(),
            failing_offsets: HashSet::new(),
            decode_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        MockDecoder {
            latency,
            ..MockDecoder::new()
        }
    }

    /// Per-offset decode latencies on top of a default, for tests that
    /// need deterministic completion orderings.
    pub fn with_latency_at(
        default: Duration,
        at: impl IntoIterator<Item = (u64, Duration)>,
    ) -> Self {
        MockDecoder {
            latency: default,
            latency_at: at.into_iter().collect(),
            ..MockDecoder::new()
        }
    }

    pub fn failing_at(offsets: impl IntoIterator<Item = u64>) -> Self {
        MockDecoder {
            failing_offsets: offsets.into_iter().collect(),
            ..MockDecoder::new()
        }
    }

    /// How often `block_offset` was decoded so far.
    pub fn decode_count(&self, block_offset: u64) -> usize {
        *self
            .decode_counts
            .lock()
            .unwrap()
            .get(&block_offset)
            .unwrap_or(&0)
    }

    pub fn total_decodes(&self) -> usize {
        self.decode_counts.lock().unwrap().values().sum()
    }
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDecoder for MockDecoder {
    type Block = MockBlock;

    fn decode_block(&self, block_offset: u64, next_block_offset: u64)
        -> PargzResult<MockBlock>
    {
        let latency = self
            .latency_at
            .get(&block_offset)
            .copied()
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        *self
            .decode_counts
            .lock()
            .unwrap()
            .entry(block_offset)
            .or_insert(0) += 1;

        if self.failing_offsets.contains(&block_offset) {
            return Err(PargzError::decode(format!(
                "mock failure at offset {block_offset}"
            )));
        }

        Ok(MockBlock {
            block_offset,
            next_block_offset,
        })
    }
}

/// A finder over a synthetic plain-gzip file with `block_count` confirmed
/// offsets 80, 88, 96, ... and enough file behind them, finalized so that
/// prefetching stays within the confirmed range.
pub fn finalized_mock_finder(block_count: usize) -> Arc<crate::block_finder::GzipBlockFinder> {
    let mut data = gzip_member(b"mock finder fixture");
    data.resize(64 * 1024, 0);
    let finder = crate::block_finder::GzipBlockFinder::new(
        Arc::new(crate::source::MemorySource::new(data)),
        32 * 1024,
    )
    .unwrap();
    for i in 1..block_count {
        finder.insert(80 + (i as u64) * 8).unwrap();
    }
    finder.finalize();
    Arc::new(finder)
}

/// Offset of the i-th block of [`finalized_mock_finder`].
pub fn mock_offset(index: usize) -> u64 {
    80 + (index as u64) * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_member_is_20_bytes() {
        assert_eq!(empty_gzip_member().len(), 20);
    }

    #[test]
    fn test_bgzf_member_roundtrips_through_flate2() {
        use std::io::Read;
        let payload = b"bgzf member fixture payload";
        let member = bgzf_member(payload);

        let mut decoder = flate2::read::GzDecoder::new(&member[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);

        // BSIZE covers the whole member.
        let bsize = u16::from_le_bytes([member[16], member[17]]) as usize;
        assert_eq!(bsize + 1, member.len());
    }

    #[test]
    fn test_incompressible_is_deterministic() {
        assert_eq!(incompressible(100, 5), incompressible(100, 5));
        assert_ne!(incompressible(100, 5), incompressible(100, 6));
    }

    #[test]
    fn test_mock_decoder_counts_and_fails() {
        let decoder = MockDecoder::failing_at([16]);
        assert!(decoder.decode_block(8, 16).is_ok());
        assert!(decoder.decode_block(8, 16).is_ok());
        assert!(decoder.decode_block(16, 24).is_err());
        assert_eq!(decoder.decode_count(8), 2);
        assert_eq!(decoder.decode_count(16), 1);
        assert_eq!(decoder.total_decodes(), 3);
    }
}
