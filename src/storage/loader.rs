//! Chunk-shuffled training reads from a disk store.
//!
//! The logical row range is cut into `chunk_size` chunks. A worker owns a
//! contiguous slice of the chunk list, visits its chunks in random order,
//! reads each chunk with one range read and yields the chunk's rows in a
//! fresh random order. Shuffling is therefore two-level: chunk order and
//! row order within a chunk.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{SimError, SimResult, StoreError, TraceError};
use crate::samples::{Sample, SampleStore, SampleTransform};

use super::disk_store::ChunkedDiskStore;

/// Chunks owned by `worker_id` out of `num_workers`.
///
/// Each worker gets `ceil(n_chunks / num_workers)` consecutive chunks; the
/// last workers may get fewer or none.
#[must_use]
pub fn chunk_partition(n_chunks: usize, num_workers: usize, worker_id: usize) -> Range<usize> {
    if num_workers == 0 {
        return 0..0;
    }
    let per_worker = n_chunks.div_ceil(num_workers);
    let start = (worker_id * per_worker).min(n_chunks);
    let end = ((worker_id + 1) * per_worker).min(n_chunks);
    start..end
}

/// Options for a [`ChunkStream`].
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Logical rows to read; the whole store when `None`.
    pub idx_range: Option<Range<usize>>,
    /// `(worker_id, num_workers)`; a single stream owns every chunk when `None`.
    pub worker: Option<(usize, usize)>,
    /// Shuffle seed; drawn from entropy when `None`.
    pub seed: Option<u64>,
    /// Applied to every row after it is read.
    pub transform: Option<SampleTransform>,
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("idx_range", &self.idx_range)
            .field("worker", &self.worker)
            .field("seed", &self.seed)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// One pass over (a worker's share of) the store in chunk-shuffled order.
pub struct ChunkStream {
    store: ChunkedDiskStore,
    offset: usize,
    end: usize,
    chunk_size: usize,
    order: Vec<usize>,
    next_chunk: usize,
    current: Option<SampleStore>,
    pending: VecDeque<usize>,
    rng: StdRng,
    transform: Option<SampleTransform>,
}

impl ChunkStream {
    /// Prepares a stream; no rows are read until iteration starts.
    pub fn new(store: &ChunkedDiskStore, options: StreamOptions) -> SimResult<Self> {
        let len = store.len()?;
        let chunk_size = store.chunk_size()?;
        let range = options.idx_range.unwrap_or(0..len);
        if range.start > range.end || range.end > len {
            return Err(StoreError::IndexOutOfRange {
                index: range.end.max(range.start),
                len,
            }
            .into());
        }
        let n_chunks = range.len().div_ceil(chunk_size);
        let owned = match options.worker {
            None => 0..n_chunks,
            Some((id, count)) if count > 0 && id < count => chunk_partition(n_chunks, count, id),
            Some((id, count)) => {
                return Err(TraceError::invalid(format!("worker {id} out of range for {count} workers")).into());
            }
        };

        let mut rng = options.seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let mut order: Vec<usize> = owned.collect();
        order.shuffle(&mut rng);
        Ok(Self {
            store: store.clone(),
            offset: range.start,
            end: range.end,
            chunk_size,
            order,
            next_chunk: 0,
            current: None,
            pending: VecDeque::new(),
            rng,
            transform: options.transform,
        })
    }

    /// Chunks this stream will read.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.order.len()
    }

    fn load_next_chunk(&mut self) -> Option<SimResult<()>> {
        let chunk = *self.order.get(self.next_chunk)?;
        self.next_chunk += 1;
        let start = self.offset + chunk * self.chunk_size;
        let end = (start + self.chunk_size).min(self.end);
        match self.store.slice(start..end) {
            Ok(rows) => {
                let mut perm: Vec<usize> = (0..rows.len()).collect();
                perm.shuffle(&mut self.rng);
                self.pending = perm.into();
                self.current = Some(rows);
                Some(Ok(()))
            }
            Err(e) => {
                // fuse
                self.next_chunk = self.order.len();
                Some(Err(e))
            }
        }
    }
}

impl Iterator for ChunkStream {
    type Item = SimResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let (Some(rows), Some(index)) = (&self.current, self.pending.pop_front()) {
                let sample = rows.row(index);
                return Some(match (&self.transform, sample) {
                    (Some(transform), Ok(sample)) => transform(sample),
                    (_, sample) => sample,
                });
            }
            if let Err(e) = self.load_next_chunk()? {
                return Some(Err(e));
            }
        }
    }
}

/// Configuration for a [`ParallelLoader`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Reader threads; each owns one chunk partition.
    pub num_workers: usize,
    /// Rows buffered between readers and the consumer.
    pub queue_capacity: usize,
    /// Logical rows to read; the whole store when `None`.
    pub idx_range: Option<Range<usize>>,
    /// Base shuffle seed; worker `i` uses `seed + i`.
    pub seed: Option<u64>,
    /// Rows per yielded batch.
    pub batch_size: usize,
    /// Drop a final batch smaller than `batch_size`.
    pub drop_last: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            queue_capacity: 256,
            idx_range: None,
            seed: None,
            batch_size: 64,
            drop_last: false,
        }
    }
}

impl LoaderConfig {
    pub fn validate(self) -> SimResult<Self> {
        if self.num_workers == 0 {
            return Err(TraceError::invalid("num_workers must be > 0").into());
        }
        if self.queue_capacity == 0 {
            return Err(TraceError::invalid("queue_capacity must be > 0").into());
        }
        if self.batch_size == 0 {
            return Err(TraceError::invalid("batch_size must be > 0").into());
        }
        Ok(self)
    }
}

/// Batches rows read by a pool of [`ChunkStream`] threads.
///
/// Rows from different workers interleave in arrival order. Iteration ends
/// when every worker has finished its partition, or after the first error.
pub struct ParallelLoader {
    rx: Option<Receiver<SimResult<Sample>>>,
    workers: Vec<JoinHandle<()>>,
    batch_size: usize,
    drop_last: bool,
    done: bool,
}

impl ParallelLoader {
    /// Starts one reader thread per worker partition.
    pub fn spawn(store: &ChunkedDiskStore, config: LoaderConfig, transform: Option<SampleTransform>) -> SimResult<Self> {
        let config = config.validate()?;
        let (tx, rx) = bounded::<SimResult<Sample>>(config.queue_capacity);

        let mut workers = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let options = StreamOptions {
                idx_range: config.idx_range.clone(),
                worker: Some((id, config.num_workers)),
                seed: config.seed.map(|seed| seed.wrapping_add(id as u64)),
                transform: transform.clone(),
            };
            let stream = ChunkStream::new(store, options)?;
            debug!("Loader worker {id} owns {} chunks", stream.num_chunks());

            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ratiosim-loader-{id}"))
                .spawn(move || {
                    for item in stream {
                        let failed = item.is_err();
                        if tx.send(item).is_err() || failed {
                            break;
                        }
                    }
                })
                .map_err(|e| SimError::internal(format!("failed to spawn loader thread: {e}")))?;
            workers.push(handle);
        }

        Ok(Self {
            rx: Some(rx),
            workers,
            batch_size: config.batch_size,
            drop_last: config.drop_last,
            done: false,
        })
    }
}

impl Iterator for ParallelLoader {
    type Item = SimResult<SampleStore>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let rx = self.rx.as_ref()?;
        let mut rows = Vec::with_capacity(self.batch_size);
        while rows.len() < self.batch_size {
            match rx.recv() {
                Ok(Ok(sample)) => rows.push(sample),
                Ok(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Err(_) => {
                    self.done = true;
                    break;
                }
            }
        }
        if rows.is_empty() || (self.drop_last && rows.len() < self.batch_size) {
            return None;
        }
        Some(SampleStore::collate(&rows))
    }
}

impl Drop for ParallelLoader {
    fn drop(&mut self) {
        // Disconnect first so blocked senders exit.
        drop(self.rx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
