//! pargz - parallel gzip/BGZF block decompression pipeline
//!
//! DEFLATE is a fundamentally sequential format, yet its decompression can
//! be scaled across cores with a speculative, prefetch-driven block
//! pipeline:
//!
//! 1. A [`GzipBlockFinder`](block_finder::GzipBlockFinder) partitions the
//!    compressed stream into bit-accurate block offsets: confirmed ones
//!    where they are known (BGZF makes them cheap to enumerate), regular
//!    grid guesses beyond.
//! 2. A [`BlockFetcher`](block_fetcher::BlockFetcher) serves block
//!    requests from two LRU caches, decodes misses on a priority thread
//!    pool, and keeps the pool saturated with speculative prefetches
//!    predicted by a [`FetchingStrategy`](fetching_strategy::FetchingStrategy).
//! 3. During speculative block-boundary search, candidate bit offsets are
//!    accepted or rejected by the branchless
//!    [`check_precode`](precode_check::check_precode) test backed by a
//!    2 MiB validity table.
//!
//! The fetcher's public surface is single-caller: one manager thread
//! issues `get`s, worker threads only ever run decode tasks.

pub mod bgzf;
pub mod block_decoder;
pub mod block_fetcher;
pub mod block_finder;
pub mod block_scanner;
pub mod error;
pub mod fetching_strategy;
pub mod gzip;
pub mod lru_cache;
pub mod precode_check;
pub mod source;
pub mod thread_pool;

#[cfg(test)]
pub mod test_utils;


pub use block_decoder::{BlockDecoder, DecodedBlock, GzipBlockDecoder, UNKNOWN_NEXT_OFFSET};
pub use block_fetcher::{BlockFetcher, FetcherOptions, FetcherStatistics};
pub use block_finder::GzipBlockFinder;
pub use error::{PargzError, PargzResult};
pub use fetching_strategy::{FetchNextAdaptive, FetchNextFixed, FetchingStrategy};
pub use lru_cache::LruCache;
pub use source::{BlockSource, FileSource, MemorySource};
pub use thread_pool::{TaskHandle, ThreadPinning, ThreadPool};
