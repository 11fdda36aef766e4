//! Block Fetcher: Cache-Backed Speculative Block Access
//!
//! The heart of the parallel decompression pipeline. A single manager
//! thread calls [`BlockFetcher::get`] with block offsets; the fetcher
//! serves them from its caches where possible and otherwise decodes on a
//! thread pool, while speculatively prefetching the blocks an access-
//! pattern strategy predicts next. Calls to members are not thread-safe;
//! the public surface has exactly one caller.
//!
//! Two separate LRU caches keep prefetched-but-unused data from evicting
//! recently used blocks: `cache` holds on-demand results and promoted
//! prefetch hits, `prefetch_cache` holds completed prefetches. In-flight
//! prefetches live in an offset-ordered map of pending task handles.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::block_decoder::{BlockDecoder, UNKNOWN_NEXT_OFFSET};
use crate::block_finder::GzipBlockFinder;
use crate::error::PargzResult;
use crate::fetching_strategy::FetchingStrategy;
use crate::lru_cache::{CacheStatistics, LruCache};
use crate::thread_pool::{TaskHandle, ThreadPinning, ThreadPool};

/// Maps a block offset to the offset of the partition containing it; used
/// to suppress duplicate prefetches when a block is reachable both through
/// its own offset and its partition's.
pub type PartitionOffsetFn = dyn Fn(u64) -> u64;

/// Decode task priority for both on-demand and prefetch work.
const DECODE_PRIORITY: i32 = 0;
/// Priority for externally scoped work that must jump the decode queue.
const HIGH_PRIORITY: i32 = -1;

/// How long a single poll on the pending on-demand result waits before the
/// prefetch loop is re-entered. At ~4 MiB compressed blocks and ~200 MB/s
/// decode bandwidth one block takes ~20 ms, so 1 ms keeps the pool fed
/// without busy-waiting.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Micro-wait on the block finder for offsets it has not discovered yet.
const BLOCK_FINDER_WAIT: Duration = Duration::from_micros(100);

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    /// Worker count; 0 means one per logical CPU.
    pub parallelization: usize,
    /// Record access patterns and timings.
    pub enable_statistics: bool,
    /// Print the profile (including pool efficiency) at teardown.
    pub show_profile: bool,
    /// Optional worker-to-core pinning.
    pub pinning: ThreadPinning,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        FetcherOptions {
            parallelization: 0,
            enable_statistics: true,
            show_profile: false,
            pinning: ThreadPinning::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetcherStatistics {
    pub parallelization: usize,
    pub block_count: usize,
    pub block_count_finalized: bool,

    pub cache: CacheStatistics,
    pub prefetch_cache: CacheStatistics,

    pub gets: usize,
    pub last_accessed_block: Option<usize>,
    pub repeated_block_accesses: usize,
    pub sequential_block_accesses: usize,
    pub backward_block_accesses: usize,
    pub forward_block_accesses: usize,

    pub on_demand_fetch_count: usize,
    pub prefetch_count: usize,
    pub prefetch_direct_hits: usize,
    pub wait_on_block_finder_count: usize,

    /// Sum of per-task decode durations across all workers.
    pub decode_block_total_time: f64,
    /// Wall-clock span from the first decode start to the last decode end.
    pub decode_wall_clock_time: f64,
    pub future_wait_total_time: f64,
    pub get_total_time: f64,
    pub read_block_data_total_time: f64,
}

impl FetcherStatistics {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.gets == 0 {
            return 0.0;
        }
        (self.cache.hits + self.prefetch_cache.hits + self.prefetch_direct_hits) as f64
            / self.gets as f64
    }

    pub fn useless_prefetches(&self) -> f64 {
        let total_fetches = self.prefetch_count + self.on_demand_fetch_count;
        if total_fetches == 0 {
            return 0.0;
        }
        self.prefetch_cache.unused_entries as f64 / total_fetches as f64
    }

    /// Ratio of the ideal parallel decode time (sum of decode durations
    /// divided by the worker count) to the realized wall-clock decode span.
    /// Only meaningful when the pool is not larger than the machine.
    pub fn pool_efficiency(&self) -> f64 {
        if self.decode_wall_clock_time == 0.0 || self.parallelization == 0 {
            return 0.0;
        }
        (self.decode_block_total_time / self.parallelization as f64)
            / self.decode_wall_clock_time
    }

    pub fn print(&self) -> String {
        let existing_blocks = if self.block_count_finalized {
            format!("{}", self.block_count)
        } else {
            format!(">={}", self.block_count)
        };

        let mut out = String::new();
        let _ = write!(
            out,
            "\n   Parallelization                   : {}\
             \n   Cache\
             \n       Hits                          : {}\
             \n       Misses                        : {}\
             \n       Unused Entries                : {}\
             \n       Maximum Fill Size             : {}\
             \n       Capacity                      : {}\
             \n   Prefetch Cache\
             \n       Hits                          : {}\
             \n       Misses                        : {}\
             \n       Unused Entries                : {}\
             \n       Prefetch Queue Hit            : {}\
             \n       Maximum Fill Size             : {}\
             \n       Capacity                      : {}\
             \n   Cache Hit Rate                    : {:.2} %\
             \n   Useless Prefetches                : {:.2} %\
             \n   Access Patterns\
             \n       Total Accesses                : {}\
             \n       Duplicate Block Accesses      : {}\
             \n       Sequential Block Accesses     : {}\
             \n       Block Seeks Back              : {}\
             \n       Block Seeks Forward           : {}\
             \n   Blocks\
             \n       Total Existing                : {}\
             \n       Total Fetched                 : {}\
             \n       Prefetched                    : {}\
             \n       Fetched On-demand             : {}\
             \n   Prefetch Stall by BlockFinder     : {}\
             \n   Time spent in:\
             \n       readBlockData                 : {:.6} s\
             \n       decodeBlock                   : {:.6} s\
             \n       result wait                   : {:.6} s\
             \n       get                           : {:.6} s\
             \n   Thread Pool Utilization:\
             \n       Total Real Decode Duration    : {:.6} s\
             \n       Theoretical Optimal Duration  : {:.6} s\
             \n       Pool Efficiency (Fill Factor) : {:.2} %",
            self.parallelization,
            self.cache.hits,
            self.cache.misses,
            self.cache.unused_entries,
            self.cache.max_size,
            self.cache.capacity,
            self.prefetch_cache.hits,
            self.prefetch_cache.misses,
            self.prefetch_cache.unused_entries,
            self.prefetch_direct_hits,
            self.prefetch_cache.max_size,
            self.prefetch_cache.capacity,
            self.cache_hit_rate() * 100.0,
            self.useless_prefetches() * 100.0,
            self.gets,
            self.repeated_block_accesses,
            self.sequential_block_accesses,
            self.backward_block_accesses,
            self.forward_block_accesses,
            existing_blocks,
            self.prefetch_count + self.on_demand_fetch_count,
            self.prefetch_count,
            self.on_demand_fetch_count,
            self.wait_on_block_finder_count,
            self.read_block_data_total_time,
            self.decode_block_total_time,
            self.future_wait_total_time,
            self.get_total_time,
            self.decode_wall_clock_time,
            self.decode_block_total_time / self.parallelization.max(1) as f64,
            self.pool_efficiency() * 100.0,
        );
        out
    }

    fn record_block_index_get(&mut self, block_index: usize) {
        self.gets += 1;

        match self.last_accessed_block {
            // The first access opens a sequential run.
            None => self.sequential_block_accesses += 1,
            Some(last) if block_index > last + 1 => self.forward_block_accesses += 1,
            Some(last) if block_index < last => self.backward_block_accesses += 1,
            Some(last) if block_index == last => self.repeated_block_accesses += 1,
            Some(_) => self.sequential_block_accesses += 1,
        }

        self.last_accessed_block = Some(block_index);
    }
}

/// Worker-updated decode timing, the only state shared across threads.
#[derive(Default)]
struct DecodeAnalytics {
    decode_start: Option<Instant>,
    decode_end: Option<Instant>,
    decode_total_time: f64,
}

pub struct BlockFetcher<D: BlockDecoder, S: FetchingStrategy> {
    parallelization: usize,
    options: FetcherOptions,

    /// Only the managing thread may talk to the block finder; confirming
    /// offsets invalidates later block indices, so workers never see it.
    block_finder: Arc<GzipBlockFinder>,
    decoder: Arc<D>,

    cache: LruCache<u64, Arc<D::Block>>,
    prefetch_cache: LruCache<u64, Arc<D::Block>>,
    fetching_strategy: S,

    /// In-flight prefetches by block offset.
    prefetching: BTreeMap<u64, TaskHandle<D::Block>>,
    thread_pool: ThreadPool,

    statistics: FetcherStatistics,
    analytics: Arc<Mutex<DecodeAnalytics>>,
}

impl<D: BlockDecoder, S: FetchingStrategy> BlockFetcher<D, S> {
    pub fn new(
        block_finder: Arc<GzipBlockFinder>,
        decoder: Arc<D>,
        fetching_strategy: S,
        parallelization: usize,
    ) -> Self {
        Self::with_options(
            block_finder,
            decoder,
            fetching_strategy,
            FetcherOptions {
                parallelization,
                ..FetcherOptions::default()
            },
        )
    }

    pub fn with_options(
        block_finder: Arc<GzipBlockFinder>,
        decoder: Arc<D>,
        fetching_strategy: S,
        options: FetcherOptions,
    ) -> Self {
        let parallelization = if options.parallelization == 0 {
            num_cpus::get().max(1)
        } else {
            options.parallelization
        };

        let statistics = FetcherStatistics {
            parallelization,
            ..FetcherStatistics::default()
        };

        BlockFetcher {
            parallelization,
            block_finder,
            decoder,
            cache: LruCache::new(16.max(parallelization)),
            // Sizing this equal to the parallelization would lead to a lot
            // of cache pollution; see the module docs.
            prefetch_cache: LruCache::new(2 * parallelization),
            fetching_strategy,
            prefetching: BTreeMap::new(),
            thread_pool: ThreadPool::with_pinning(parallelization, options.pinning.clone()),
            statistics,
            analytics: Arc::new(Mutex::new(DecodeAnalytics::default())),
            options,
        }
    }

    pub fn parallelization(&self) -> usize {
        self.parallelization
    }

    /// Number of prefetch tasks currently in flight.
    pub fn pending_prefetch_count(&self) -> usize {
        self.prefetching.len()
    }

    /// In how many of {main cache, prefetch cache, prefetch map} the
    /// offset currently lives; at most one between public operations.
    #[cfg(test)]
    pub(crate) fn cache_location_count(&self, block_offset: u64) -> usize {
        usize::from(self.prefetching.contains_key(&block_offset))
            + usize::from(self.cache.test(&block_offset))
            + usize::from(self.prefetch_cache.test(&block_offset))
    }

    /// Fetch the block at `block_offset`, consulting the caches and the
    /// in-flight prefetches first and decoding on demand otherwise.
    ///
    /// `data_block_index` skips the block finder lookup for the access-
    /// pattern bookkeeping; it is required for offsets (e.g. partition
    /// offsets) the finder cannot resolve through `find`. With
    /// `only_check_caches` a miss returns `Ok(None)` instead of decoding.
    /// `get_partition_offset` enables duplicate-prefetch suppression
    /// across partition-aliased offsets.
    ///
    /// A decode failure of the on-demand task surfaces here; failed
    /// prefetches are dropped and retried on demand if actually requested.
    pub fn get(
        &mut self,
        block_offset: u64,
        data_block_index: Option<usize>,
        only_check_caches: bool,
        get_partition_offset: Option<&PartitionOffsetFn>,
    ) -> PargzResult<Option<Arc<D::Block>>> {
        let t_get_start = Instant::now();

        let (cached_result, mut queued_result) = self.get_from_caches(block_offset);

        let data_block_index = match data_block_index {
            Some(index) => index,
            None => self.block_finder.find(block_offset)?,
        };
        let next_block_offset = self.block_finder.get(data_block_index + 1, None);

        if self.options.enable_statistics {
            self.statistics.record_block_index_get(data_block_index);
        }

        // Start the requested decode if necessary.
        if cached_result.is_none() && queued_result.is_none() {
            if only_check_caches {
                return Ok(None);
            }
            queued_result = Some(self.submit_on_demand_task(block_offset, next_block_offset));
        }

        self.fetching_strategy.fetch(data_block_index);

        {
            let have_cached = cached_result.is_some();
            let queued = &queued_result;
            let result_is_ready =
                move || have_cached || queued.as_ref().is_some_and(TaskHandle::is_ready);
            self.prefetch_new_blocks(get_partition_offset, &result_is_ready);
        }

        if let Some(result) = cached_result {
            debug_assert!(queued_result.is_none());
            if self.options.enable_statistics {
                self.statistics.get_total_time += t_get_start.elapsed().as_secs_f64();
            }
            return Ok(Some(result));
        }

        let queued = queued_result.expect("an on-demand task was submitted above");

        // Keep the pool saturated while waiting on the decode.
        let t_future_start = Instant::now();
        let decode_result = loop {
            match queued.wait_timeout(RESULT_POLL_INTERVAL) {
                Some(result) => break result,
                None => {
                    let result_is_ready = || queued.is_ready();
                    self.prefetch_new_blocks(get_partition_offset, &result_is_ready);
                }
            }
        };
        let future_wait_time = t_future_start.elapsed().as_secs_f64();

        let result = Arc::new(decode_result?);
        self.insert_into_cache(block_offset, Arc::clone(&result));

        if self.options.enable_statistics {
            self.statistics.future_wait_total_time += future_wait_time;
            self.statistics.get_total_time += t_get_start.elapsed().as_secs_f64();
        }

        Ok(Some(result))
    }

    /// Empty the main cache. In-flight prefetches and the prefetch cache
    /// are preserved.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn statistics(&self) -> FetcherStatistics {
        let mut result = self.statistics.clone();
        result.block_count_finalized = self.block_finder.finalized();
        result.block_count = self.block_finder.size();
        result.cache = self.cache.statistics();
        result.prefetch_cache = self.prefetch_cache.statistics();
        result.read_block_data_total_time = self.decoder.read_time_seconds();

        let analytics = self.analytics.lock().unwrap();
        result.decode_block_total_time = analytics.decode_total_time;
        result.decode_wall_clock_time = match (analytics.decode_start, analytics.decode_end)
        {
            (Some(start), Some(end)) => end.saturating_duration_since(start).as_secs_f64(),
            _ => 0.0,
        };
        result
    }

    /// Submit externally scoped work that must run before queued decodes.
    pub fn submit_high_priority_task<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> PargzResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.thread_pool.submit(task, HIGH_PRIORITY)
    }

    fn insert_into_cache(&mut self, block_offset: u64, block: Arc<D::Block>) {
        // A sequential scan must not pollute the cache: everything before
        // the current block will not be requested again.
        if self.fetching_strategy.is_sequential() {
            self.cache.clear();
        }
        self.cache.insert(block_offset, block);
    }

    fn is_in_cache_or_queue(&self, block_offset: u64) -> bool {
        self.prefetching.contains_key(&block_offset)
            || self.cache.test(&block_offset)
            || self.prefetch_cache.test(&block_offset)
    }

    /// Either a finished value from the caches or the pending handle from
    /// the prefetch map. A returned handle is *moved out* of the map: it
    /// must be waited on (and the result cached), not discarded.
    fn get_from_caches(
        &mut self,
        block_offset: u64,
    ) -> (Option<Arc<D::Block>>, Option<TaskHandle<D::Block>>) {
        // A late prefetch may still be running; that is a direct hit too.
        if let Some(handle) = self.take_from_prefetch_queue(block_offset) {
            return (None, Some(handle));
        }

        if let Some(result) = self.cache.get(&block_offset) {
            return (Some(result), None);
        }

        // On a prefetch-cache hit, promote the value into the main cache.
        if let Some(result) = self.prefetch_cache.get(&block_offset) {
            self.prefetch_cache.evict(&block_offset);
            self.insert_into_cache(block_offset, Arc::clone(&result));
            return (Some(result), None);
        }

        (None, None)
    }

    fn take_from_prefetch_queue(&mut self, block_offset: u64) -> Option<TaskHandle<D::Block>> {
        let handle = self.prefetching.remove(&block_offset);
        if handle.is_some() && self.options.enable_statistics {
            self.statistics.prefetch_direct_hits += 1;
        }
        handle
    }

    /// Move finished prefetches into the prefetch cache. Failed prefetches
    /// are discarded: if the offset is requested later, the on-demand path
    /// re-runs the decoder and surfaces the real error.
    fn process_ready_prefetches(&mut self) {
        let ready: Vec<u64> = self
            .prefetching
            .iter()
            .filter(|(_, handle)| handle.is_ready())
            .map(|(&offset, _)| offset)
            .collect();

        for block_offset in ready {
            let handle = self
                .prefetching
                .remove(&block_offset)
                .expect("collected above");
            match handle.wait() {
                Ok(block) => {
                    self.prefetch_cache.insert(block_offset, Arc::new(block));
                }
                Err(error) => {
                    if std::env::var("PARGZ_DEBUG").is_ok() {
                        eprintln!(
                            "[pargz] dropping failed prefetch at bit offset {block_offset}: {error}"
                        );
                    }
                }
            }
        }
    }

    /// Fill the prefetch map with up to `parallelization - 1` new decode
    /// tasks predicted from the last accessed block indices. The fetcher
    /// may wait tiny amounts on the block finder for undiscovered offsets,
    /// but backs off as soon as `stop_prefetching` reports the awaited
    /// primary result as ready.
    fn prefetch_new_blocks(
        &mut self,
        get_partition_offset: Option<&PartitionOffsetFn>,
        stop_prefetching: &dyn Fn() -> bool,
    ) {
        // Make room for new asynchronous prefetches.
        self.process_ready_prefetches();

        // +1 reserves a worker for the on-demand task.
        let pool_size = self.thread_pool.size();
        if self.prefetching.len() + 1 >= pool_size {
            return;
        }

        let block_indexes = self
            .fetching_strategy
            .prefetch(self.prefetch_cache.capacity());

        // Materialize the candidate offsets. A zero timeout suffices: an
        // offset the finder cannot produce instantly is not cached either.
        let mut block_offsets = Vec::with_capacity(2 * block_indexes.len());
        for &index in &block_indexes {
            let Some(offset) = self.block_finder.get(index, Some(Duration::ZERO)) else {
                continue;
            };
            block_offsets.push(offset);
            if let Some(partition) = get_partition_offset {
                let partition_offset = partition(offset);
                if partition_offset != offset {
                    block_offsets.push(partition_offset);
                }
            }
        }

        // Touch all candidates already in a cache so the prefetch burst
        // cannot evict them; reverse order leaves the earliest most
        // recently used.
        for &offset in block_offsets.iter().rev() {
            if self.prefetch_cache.test(&offset) {
                self.prefetch_cache.touch(&offset);
            }
            if self.cache.test(&offset) {
                self.cache.touch(&offset);
            }
        }

        for &index in &block_indexes {
            if self.prefetching.len() + 1 >= pool_size {
                break;
            }

            if self.block_finder.finalized() && index >= self.block_finder.size() {
                continue;
            }

            // If the offsets for this index are not discovered yet and we
            // have to wait on the primary result anyway, give the block
            // finder a little time.
            let mut block_offset;
            let mut next_block_offset;
            loop {
                let finder_timeout = |stop: bool| {
                    if stop {
                        Some(Duration::ZERO)
                    } else {
                        Some(BLOCK_FINDER_WAIT)
                    }
                };
                block_offset = self
                    .block_finder
                    .get(index, finder_timeout(stop_prefetching()));
                let was_finalized = self.block_finder.finalized();
                next_block_offset = self
                    .block_finder
                    .get(index + 1, finder_timeout(stop_prefetching()));
                if was_finalized && next_block_offset.is_none() {
                    next_block_offset = Some(UNKNOWN_NEXT_OFFSET);
                }
                if block_offset.is_some() || next_block_offset.is_some() || stop_prefetching()
                {
                    break;
                }
            }

            if self.options.enable_statistics && block_offset.is_none() {
                self.statistics.wait_on_block_finder_count += 1;
            }

            let (Some(block_offset), Some(next_block_offset)) =
                (block_offset, next_block_offset)
            else {
                continue;
            };

            // No duplicate prefetches, neither directly nor through the
            // partition alias.
            if self.is_in_cache_or_queue(block_offset) {
                continue;
            }
            if let Some(partition) = get_partition_offset {
                if self.is_in_cache_or_queue(partition(block_offset)) {
                    continue;
                }
            }

            // Cache-pollution guard: stop when this round's insertions
            // would evict an offset the round itself still wants. The
            // pending prefetches land first, hence the +1 lookahead.
            if let Some(evicted_offset) = self
                .prefetch_cache
                .next_nth_eviction(self.prefetching.len() + 1)
            {
                if block_offsets.contains(&evicted_offset) {
                    break;
                }
            }

            if self.options.enable_statistics {
                self.statistics.prefetch_count += 1;
            }
            let handle = self.submit_decode_task(block_offset, next_block_offset);
            let previous = self.prefetching.insert(block_offset, handle);
            debug_assert!(
                previous.is_none(),
                "duplicate prefetch insertion for offset {block_offset}"
            );
        }

        // Even with the unconditionally submitted requested block, the
        // thread pool must never hold more tasks than workers.
        debug_assert!(
            self.thread_pool.unprocessed_tasks_count(None) <= self.parallelization,
            "the thread pool holds more tasks than there are prefetch slots"
        );
    }

    fn submit_on_demand_task(
        &mut self,
        block_offset: u64,
        next_block_offset: Option<u64>,
    ) -> TaskHandle<D::Block> {
        if self.options.enable_statistics {
            self.statistics.on_demand_fetch_count += 1;
        }
        self.submit_decode_task(
            block_offset,
            next_block_offset.unwrap_or(UNKNOWN_NEXT_OFFSET),
        )
    }

    fn submit_decode_task(
        &self,
        block_offset: u64,
        next_block_offset: u64,
    ) -> TaskHandle<D::Block> {
        let decoder = Arc::clone(&self.decoder);
        let analytics = Arc::clone(&self.analytics);
        let enable_statistics = self.options.enable_statistics;

        self.thread_pool.submit(
            move || {
                let t_decode_start = Instant::now();
                let result = decoder.decode_block(block_offset, next_block_offset);

                if enable_statistics {
                    let t_decode_end = Instant::now();
                    let mut analytics = analytics.lock().unwrap();
                    analytics.decode_start = Some(
                        analytics
                            .decode_start
                            .map_or(t_decode_start, |t| t.min(t_decode_start)),
                    );
                    analytics.decode_end = Some(
                        analytics
                            .decode_end
                            .map_or(t_decode_end, |t| t.max(t_decode_end)),
                    );
                    analytics.decode_total_time +=
                        t_decode_end.duration_since(t_decode_start).as_secs_f64();
                }

                result
            },
            DECODE_PRIORITY,
        )
    }
}

impl<D: BlockDecoder, S: FetchingStrategy> Drop for BlockFetcher<D, S> {
    fn drop(&mut self) {
        if self.options.enable_statistics || self.options.show_profile {
            // Clear the caches while updating the unused-entries counts.
            self.cache.shrink_to(0);
            self.prefetch_cache.shrink_to(0);
        }
        if self.options.show_profile {
            eprintln!("[BlockFetcher] {}", self.statistics().print());
        }
        // Workers capture the decoder; the pool must be fully stopped
        // before any of its inputs can go away.
        self.thread_pool.stop();
    }
}
