//! Block Decoding Seam
//!
//! The fetcher is generic over a [`BlockDecoder`], which turns a pair of
//! bit offsets into decoded block data. Workers call it concurrently, so
//! implementations must be `Sync` and must not rely on shared cursors.
//!
//! [`GzipBlockDecoder`] is the concrete implementation for byte-aligned
//! block starts (gzip members, BGZF members): it streams the raw DEFLATE
//! data through flate2 starting at the block offset. DEFLATE terminates
//! itself at the final block, so the decode neither needs the exact end
//! nor trips over the member trailer or a following member.
//! `next_block_offset` is the partition bound the caller believes in; it
//! may be a mere grid guess inside the block, so it is advisory and only
//! recorded, never used to truncate input.

use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use flate2::read::DeflateDecoder;

use crate::error::{PargzError, PargzResult};
use crate::source::BlockSource;

/// Sentinel for "the end of this block is unknown"; the maximum
/// representable offset.
pub const UNKNOWN_NEXT_OFFSET: u64 = u64::MAX;

pub trait BlockDecoder: Send + Sync + 'static {
    type Block: Send + Sync + 'static;

    /// Decode the block starting at `block_offset` (bits).
    /// `next_block_offset` is the next known or guessed block start, or
    /// [`UNKNOWN_NEXT_OFFSET`].
    fn decode_block(&self, block_offset: u64, next_block_offset: u64)
        -> PargzResult<Self::Block>;

    /// Accumulated time spent on raw source reads, for the fetcher's
    /// statistics. Implementations without read tracking report zero.
    fn read_time_seconds(&self) -> f64 {
        0.0
    }
}

/// Decoded payload of one block plus the bit range it actually occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub data: Vec<u8>,
    pub encoded_offset_bits: u64,
    /// End of the consumed DEFLATE stream.
    pub encoded_end_bits: u64,
}

/// Positional reader over a [`BlockSource`], so the inflater pulls only
/// the bytes it needs instead of the whole tail of the stream.
struct SourceReader {
    source: Arc<dyn BlockSource>,
    position: u64,
    read_time: Arc<Mutex<f64>>,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let t_read_start = Instant::now();
        let n = self.source.read_at(self.position, buf)?;
        self.position += n as u64;
        *self.read_time.lock().unwrap() += t_read_start.elapsed().as_secs_f64();
        Ok(n)
    }
}

pub struct GzipBlockDecoder {
    source: Arc<dyn BlockSource>,
    read_time: Arc<Mutex<f64>>,
}

impl GzipBlockDecoder {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        GzipBlockDecoder {
            source,
            read_time: Arc::new(Mutex::new(0.0)),
        }
    }
}

impl BlockDecoder for GzipBlockDecoder {
    type Block = DecodedBlock;

    fn decode_block(
        &self,
        block_offset: u64,
        _next_block_offset: u64,
    ) -> PargzResult<DecodedBlock> {
        if block_offset % 8 != 0 {
            return Err(PargzError::invalid_argument(
                "gzip block decoder requires byte-aligned block offsets",
            ));
        }

        let start_byte = block_offset / 8;
        if start_byte >= self.source.size() {
            return Err(PargzError::out_of_range(format!(
                "block offset {block_offset} is past the end of the stream"
            )));
        }

        let reader = SourceReader {
            source: Arc::clone(&self.source),
            position: start_byte,
            read_time: Arc::clone(&self.read_time),
        };

        let mut data = Vec::new();
        let mut decoder = DeflateDecoder::new(reader);
        decoder.read_to_end(&mut data).map_err(|e| {
            PargzError::decode(format!("inflate failed at bit offset {block_offset}: {e}"))
        })?;

        Ok(DecodedBlock {
            data,
            encoded_offset_bits: block_offset,
            encoded_end_bits: (start_byte + decoder.total_in()) * 8,
        })
    }

    fn read_time_seconds(&self) -> f64 {
        *self.read_time.lock().unwrap()
    }
}
