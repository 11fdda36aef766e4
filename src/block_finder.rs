//! Gzip Block Finder
//!
//! Bookkeeping service that hands out bit-accurate block offsets. It does
//! no decoding beyond parsing the gzip header for the first block offset:
//! confirmed offsets are inserted from outside (or gathered from the BGZF
//! scanner), and everything past the last confirmed offset is partitioned
//! into regular `spacing` guesses inside the file range.
//!
//! Confirming an offset can shift the meaning of every later block index.
//! The block fetcher relies on only the managing thread talking to the
//! finder, with insertions happening strictly between `get` calls; worker
//! threads never see post-insertion indices.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::bgzf::{is_bgzf_file, BgzfScanner};
use crate::error::{PargzError, PargzResult};
use crate::gzip;
use crate::source::BlockSource;

/// Smallest permitted spacing: one LZ77 window (32 KiB) of compressed
/// bytes, i.e. 262144 bits. Anything finer buys no parallelism and blows
/// up the bookkeeping.
pub const MIN_SPACING_BITS: u64 = 32 * 1024 * 8;

struct FinderState {
    /// Confirmed block offsets in bits, strictly increasing. A deque keeps
    /// mostly-append insertion cheap.
    block_offsets: VecDeque<u64>,
    finalized: bool,
    bgzf_scanner: Option<BgzfScanner>,
}

pub struct GzipBlockFinder {
    state: Mutex<FinderState>,
    file_size_bits: u64,
    spacing_bits: u64,
    is_bgzf: bool,
    /// BGZF offsets are gathered in batches of this many blocks ahead of
    /// the requested index.
    batch_fetch_count: usize,
}

impl GzipBlockFinder {
    /// Create a finder over `source` with a partition `spacing` in bytes.
    ///
    /// Reads and validates the gzip header; its end is the first confirmed
    /// block offset. BGZF containers additionally get a boundary scanner
    /// on an independent source handle.
    pub fn new(source: Arc<dyn BlockSource>, spacing: u64) -> PargzResult<Self> {
        let spacing_bits = spacing * 8;
        if spacing_bits < MIN_SPACING_BITS {
            return Err(PargzError::invalid_argument(format!(
                "spacing of {spacing} B is smaller than the window size"
            )));
        }

        let file_size_bits = source.size() * 8;

        // The header is variable-sized (name/comment); a generous prefix
        // covers everything that appears in practice.
        let prefix_len = (64 * 1024).min(source.size()) as usize;
        let mut prefix = vec![0u8; prefix_len];
        let n = source.read_at(0, &mut prefix)?;
        let first_block_offset = gzip::parse_header(&prefix[..n])? as u64 * 8;

        let is_bgzf = is_bgzf_file(source.as_ref());
        let bgzf_scanner = if is_bgzf {
            let mut scanner = BgzfScanner::new(Arc::clone(&source));
            // The first boundary is the already-recorded first block.
            scanner.next_boundary();
            Some(scanner)
        } else {
            None
        };

        let mut block_offsets = VecDeque::new();
        block_offsets.push_back(first_block_offset);

        Ok(GzipBlockFinder {
            state: Mutex::new(FinderState {
                block_offsets,
                finalized: false,
                bgzf_scanner,
            }),
            file_size_bits,
            spacing_bits,
            is_bgzf,
            batch_fetch_count: 16.max(3 * num_cpus::get()),
        })
    }

    /// Number of known block offsets. May keep growing until finalized.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().block_offsets.len()
    }

    pub fn finalize(&self) {
        self.state.lock().unwrap().finalized = true;
    }

    pub fn finalized(&self) -> bool {
        self.state.lock().unwrap().finalized
    }

    pub fn is_bgzf_file(&self) -> bool {
        self.is_bgzf
    }

    pub fn spacing_in_bits(&self) -> u64 {
        self.spacing_bits
    }

    pub fn file_size_in_bits(&self) -> u64 {
        self.file_size_bits
    }

    /// Insert a known-exact block offset. Offsets at or beyond the end of
    /// file are ignored; duplicates are no-ops; new offsets after
    /// [`finalize`](Self::finalize) are an error.
    pub fn insert(&self, block_offset: u64) -> PargzResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::insert_unsafe(&mut state, self.file_size_bits, block_offset)
    }

    /// Replace all confirmed offsets at once (e.g. from an imported index)
    /// and finalize.
    pub fn set_block_offsets(&self, block_offsets: Vec<u64>) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(block_offsets.windows(2).all(|w| w[0] < w[1]));
        state.block_offsets = block_offsets.into();
        state.finalized = true;
    }

    /// The block offset for `block_index`, or `None` when the finder is
    /// finalized and the index is out of range.
    ///
    /// Indices beyond the confirmed offsets resolve to grid guesses
    /// `k * spacing_bits` inside the file, then to the file size as the
    /// one-past-the-end sentinel. For BGZF streams the confirmed list is
    /// first extended by scanning member boundaries, bounded by `timeout`
    /// (`None` = unbounded, zero = non-blocking probe of known offsets).
    pub fn get(&self, block_index: usize, timeout: Option<Duration>) -> Option<u64> {
        let mut state = self.state.lock().unwrap();

        if self.is_bgzf && !state.finalized && state.bgzf_scanner.is_some() {
            self.gather_more_bgzf_blocks(&mut state, block_index, timeout);
        }

        if block_index < state.block_offsets.len() {
            return Some(state.block_offsets[block_index]);
        }

        debug_assert!(!state.block_offsets.is_empty());
        let index_outside = (block_index - state.block_offsets.len()) as u64;
        let partition_index = self.first_partition_index(&state) + index_outside;
        let block_offset = partition_index * self.spacing_bits;
        if block_offset < self.file_size_bits {
            return Some(block_offset);
        }

        // As the offset one past the last valid one, return the file size.
        if partition_index > 0 {
            let previous_offset = (partition_index - 1) * self.spacing_bits;
            if previous_offset < self.file_size_bits {
                return Some(self.file_size_bits);
            }
        }

        None
    }

    /// The index of the block at `block_offset`. Confirmed offsets shadow
    /// coincident grid guesses; offsets that are neither confirmed nor
    /// grid-aligned beyond the last confirmed one are an error.
    pub fn find(&self, block_offset: u64) -> PargzResult<usize> {
        let state = self.state.lock().unwrap();
        let offsets = &state.block_offsets;

        let insertion = offsets.partition_point(|&o| o < block_offset);
        if insertion < offsets.len() && offsets[insertion] == block_offset {
            return Ok(insertion);
        }

        let last = *offsets.back().expect("always holds the first offset");
        if block_offset > last
            && block_offset < self.file_size_bits
            && block_offset % self.spacing_bits == 0
        {
            let index = offsets.len() as u64
                + (block_offset / self.spacing_bits - self.first_partition_index(&state));
            return Ok(index as usize);
        }

        Err(PargzError::out_of_range(format!(
            "no block with offset {block_offset} exists in the block finder"
        )))
    }

    /// Round `block_offset` down to the spacing grid.
    pub fn partition_offset_containing(&self, block_offset: u64) -> u64 {
        (block_offset / self.spacing_bits) * self.spacing_bits
    }

    fn insert_unsafe(
        state: &mut FinderState,
        file_size_bits: u64,
        block_offset: u64,
    ) -> PargzResult<()> {
        if block_offset >= file_size_bits {
            return Ok(());
        }

        let insertion = state
            .block_offsets
            .partition_point(|&o| o < block_offset);
        if insertion < state.block_offsets.len()
            && state.block_offsets[insertion] == block_offset
        {
            return Ok(());
        }

        if state.finalized {
            return Err(PargzError::invalid_argument(
                "already finalized, may not insert further block offsets",
            ));
        }

        state.block_offsets.insert(insertion, block_offset);
        debug_assert!(state
            .block_offsets
            .iter()
            .zip(state.block_offsets.iter().skip(1))
            .all(|(a, b)| a < b));
        Ok(())
    }

    /// Extend the confirmed offsets from the BGZF scanner until the
    /// requested block plus one gather batch is covered. Boundaries closer
    /// than the spacing to the last confirmed offset are skipped so the
    /// partitioning stays coarse enough for parallel decoding.
    fn gather_more_bgzf_blocks(
        &self,
        state: &mut FinderState,
        block_index: usize,
        timeout: Option<Duration>,
    ) {
        let deadline = timeout.map(|t| Instant::now() + t);

        while block_index + self.batch_fetch_count >= state.block_offsets.len() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }

            let next_offset = match state
                .bgzf_scanner
                .as_mut()
                .and_then(BgzfScanner::next_boundary)
            {
                Some(offset) => offset,
                None => break,
            };

            let last = *state.block_offsets.back().expect("non-empty");
            if next_offset < last + self.spacing_bits {
                continue;
            }
            if next_offset >= self.file_size_bits {
                break;
            }
            // Insertion cannot fail: not finalized, below end of file.
            let _ = Self::insert_unsafe(state, self.file_size_bits, next_offset);
        }
    }

    /// The partition index of the first grid guess, i.e. the smallest k
    /// with `k * spacing_bits` strictly beyond the last confirmed offset.
    fn first_partition_index(&self, state: &FinderState) -> u64 {
        state.block_offsets.back().expect("non-empty") / self.spacing_bits + 1
    }
}
