//! Persistence of the full indexes
//!
//! The foreground [`Appender`] keeps accepting rows into a fresh index while the
//! [`Persister`] writes the full one into the [`PersistTarget`] in background workers.
//! The ownership of the full index is transferred to the persister, it is closed after
//! its rows are snapshotted into a [`PersistedChunk`].
//!
//! The task queue is bounded by `max_pending_persists`, submitting into a full queue
//! blocks the caller. Persists are never cancelled, dropping the persister waits for
//! the in-flight persists

mod appender;
mod target;

pub use appender::{AppendOutcome, Appender};
pub use target::{JsonLinesPersistTarget, MemoryPersistTarget, TargetError};

use std::fmt::Debug;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use rollup_procedural_macro::MetricsSetBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::aggregate::AggregatorSpec;
use crate::common::profiler::ScopedTimerGuard;
use crate::common::types::Timestamp;
use crate::common::uuid::{ChunkId, IndexId};
use crate::error::SendableError;
use crate::index::{IncrementalIndex, IndexError};
use crate::metric::{Count, Time};
use crate::row::Row;

/// Failure of a persist, shared by the handle and the flush
pub type PersistFailure = Arc<dyn std::error::Error + Send + Sync>;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum PersistError {
    #[snafu(display("Failed to persist the chunk `{chunk_id}`"))]
    Persist {
        chunk_id: ChunkId,
        source: PersistFailure,
    },
    #[snafu(display("Timed out after `{timeout:?}` with `{pending}` pending persists"))]
    FlushTimeout { timeout: Duration, pending: usize },
    #[snafu(display("Timed out after `{timeout:?}` waiting for the chunk `{chunk_id}`"))]
    HandleTimeout { chunk_id: ChunkId, timeout: Duration },
    #[snafu(display("Workers of the persister are gone"))]
    Disconnected,
    #[snafu(display("Failed to spawn the persist worker"))]
    SpawnWorker { source: std::io::Error },
    #[snafu(display("Failed to append the row into the index"))]
    Index { source: IndexError },
}

/// Result of the persistence
pub type Result<T> = std::result::Result<T, PersistError>;

/// Default number of the worker threads
pub const DEFAULT_NUM_THREADS: usize = 1;
/// Default capacity of the task queue
pub const DEFAULT_MAX_PENDING_PERSISTS: usize = 2;

/// Configuration of the [`Persister`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersisterConfig {
    /// Number of the worker threads, zero means persisting in the caller
    pub num_threads: usize,
    /// Number of the queued persists before the submit blocks
    pub max_pending_persists: usize,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            num_threads: DEFAULT_NUM_THREADS,
            max_pending_persists: DEFAULT_MAX_PENDING_PERSISTS,
        }
    }
}

/// Immutable snapshot of a full index, rows hold the intermediate values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedChunk {
    /// Id of the chunk
    pub id: ChunkId,
    /// Index the chunk is created from
    pub index_id: IndexId,
    /// Dimension order of the index
    pub dimensions: Vec<String>,
    /// Metrics of the index, used to combine the chunks
    pub metrics: Vec<AggregatorSpec>,
    /// Smallest bucket timestamp
    pub min_time: Option<Timestamp>,
    /// Largest bucket timestamp
    pub max_time: Option<Timestamp>,
    /// Rows ordered by the bucket timestamp
    #[serde(default, skip_serializing)]
    pub rows: Vec<Row>,
}

impl PersistedChunk {
    /// Snapshot the rows of the index
    pub fn from_index(id: ChunkId, index: &IncrementalIndex) -> Self {
        Self {
            id,
            index_id: index.id(),
            dimensions: index.dimension_order(),
            metrics: index.factories().iter().map(|factory| factory.spec()).collect(),
            min_time: index.min_time(),
            max_time: index.max_time(),
            rows: index.iter_rows(false).collect(),
        }
    }
}

/// External storage of the chunks
pub trait PersistTarget: Debug + Send + Sync + 'static {
    /// Write the chunk. The chunk is written exactly once
    fn persist(&self, chunk: &PersistedChunk) -> std::result::Result<(), SendableError>;
}

/// Metrics of the persister
#[derive(Debug, Default, MetricsSetBuilder)]
pub struct PersisterMetrics {
    /// Number of the chunks written
    pub chunks_persisted: Count,
    /// Number of the rows written
    pub rows_persisted: Count,
    /// Number of the failed persists
    pub failed_persists: Count,
    /// Time spent in the target
    pub persist_time: Time,
}

#[derive(Debug)]
struct Progress {
    pending: usize,
    /// First failure since the last flush
    failure: Option<(ChunkId, PersistFailure)>,
}

/// State shared by the persister and its workers
#[derive(Debug)]
struct Shared {
    target: Arc<dyn PersistTarget>,
    progress: Mutex<Progress>,
    done: Condvar,
    metrics: PersisterMetrics,
}

impl Shared {
    fn complete(&self, chunk_id: ChunkId, result: &std::result::Result<(), PersistFailure>) {
        let mut progress = self.progress.lock();
        progress.pending -= 1;
        if let Err(e) = result {
            self.metrics.failed_persists.add(1);
            progress
                .failure
                .get_or_insert_with(|| (chunk_id, Arc::clone(e)));
        }
        self.done.notify_all();
    }

    #[tracing::instrument(skip_all, fields(index = %index.id(), chunk = %chunk_id))]
    fn persist(&self, chunk_id: ChunkId, mut index: IncrementalIndex) -> PersistOutcome {
        let chunk = PersistedChunk::from_index(chunk_id, &index);
        index.close();

        let result = {
            let _guard = ScopedTimerGuard::new(&self.metrics.persist_time);
            self.target.persist(&chunk).map_err(PersistFailure::from)
        };
        match &result {
            Ok(()) => {
                self.metrics.chunks_persisted.add(1);
                self.metrics.rows_persisted.add(chunk.rows.len() as u64);
                tracing::info!("Persisted `{}` rows", chunk.rows.len());
            }
            Err(e) => tracing::error!("Failed to persist: {e}"),
        }
        self.complete(chunk_id, &result);
        result.map(|()| chunk_id)
    }
}

type PersistOutcome = std::result::Result<ChunkId, PersistFailure>;

#[derive(Debug)]
struct PersistTask {
    chunk_id: ChunkId,
    index: IncrementalIndex,
    done: Sender<PersistOutcome>,
}

/// Handle of a submitted persist
#[derive(Debug)]
pub struct PersistHandle {
    chunk_id: ChunkId,
    receiver: Receiver<PersistOutcome>,
}

impl PersistHandle {
    /// Id of the chunk that will be written
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Returns true if the outcome of the persist is ready, [`Self::wait`] returns
    /// without blocking
    pub fn is_done(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Wait for the persist
    pub fn wait(self, timeout: Duration) -> Result<ChunkId> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome.context(PersistSnafu {
                chunk_id: self.chunk_id,
            }),
            Err(RecvTimeoutError::Timeout) => HandleTimeoutSnafu {
                chunk_id: self.chunk_id,
                timeout,
            }
            .fail(),
            Err(RecvTimeoutError::Disconnected) => DisconnectedSnafu.fail(),
        }
    }
}

/// Background persister with a bounded pool of workers
#[derive(Debug)]
pub struct Persister {
    config: PersisterConfig,
    shared: Arc<Shared>,
    sender: Option<Sender<PersistTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl Persister {
    /// Create the persister and spawn its workers
    pub fn try_new(config: PersisterConfig, target: Arc<dyn PersistTarget>) -> Result<Self> {
        let shared = Arc::new(Shared {
            target,
            progress: Mutex::new(Progress {
                pending: 0,
                failure: None,
            }),
            done: Condvar::new(),
            metrics: PersisterMetrics::default(),
        });
        let mut this = Self {
            config,
            shared,
            sender: None,
            workers: Vec::with_capacity(config.num_threads),
        };
        if config.num_threads == 0 {
            return Ok(this);
        }

        let (sender, receiver) =
            crossbeam_channel::bounded::<PersistTask>(config.max_pending_persists);
        this.sender = Some(sender);
        for i in 0..config.num_threads {
            let receiver = receiver.clone();
            let shared = Arc::clone(&this.shared);
            let worker = std::thread::Builder::new()
                .name(format!("rollup-persist-{i}"))
                .spawn(move || {
                    for task in receiver.iter() {
                        let outcome = shared.persist(task.chunk_id, task.index);
                        // Handle may be dropped, the failure is still reported by flush
                        let _ = task.done.send(outcome);
                    }
                })
                .context(SpawnWorkerSnafu)?;
            this.workers.push(worker);
        }
        Ok(this)
    }

    /// Configuration of the persister
    pub fn config(&self) -> &PersisterConfig {
        &self.config
    }

    /// Metrics of the persister
    pub fn metrics(&self) -> &PersisterMetrics {
        &self.shared.metrics
    }

    /// Number of the submitted persists that are not completed
    pub fn pending(&self) -> usize {
        self.shared.progress.lock().pending
    }

    /// Submit the index. Blocks if the queue is full. Without workers, the index is
    /// persisted in the caller before returning
    pub fn submit(&self, index: IncrementalIndex) -> Result<PersistHandle> {
        let chunk_id = ChunkId::random();
        let (done, receiver) = crossbeam_channel::bounded(1);
        self.shared.progress.lock().pending += 1;

        match &self.sender {
            Some(sender) => {
                tracing::debug!("Submit index `{}` as chunk `{}`", index.id(), chunk_id);
                let task = PersistTask {
                    chunk_id,
                    index,
                    done,
                };
                if sender.send(task).is_err() {
                    self.shared.progress.lock().pending -= 1;
                    return DisconnectedSnafu.fail();
                }
            }
            None => {
                let outcome = self.shared.persist(chunk_id, index);
                let _ = done.send(outcome);
            }
        }
        Ok(PersistHandle { chunk_id, receiver })
    }

    /// Wait for all of the submitted persists. Returns the first failure since the
    /// last flush
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut progress = self.shared.progress.lock();
        while progress.pending > 0 {
            if self
                .shared
                .done
                .wait_until(&mut progress, deadline)
                .timed_out()
            {
                return FlushTimeoutSnafu {
                    timeout,
                    pending: progress.pending,
                }
                .fail();
            }
        }
        match progress.failure.take() {
            Some((chunk_id, source)) => Err(PersistError::Persist { chunk_id, source }),
            None => Ok(()),
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        // Workers exit after draining the queue
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Persist worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::index::schema::IndexConfig;
    use crate::index::tests::{row, sum_schema};

    #[derive(Debug)]
    struct FailingTarget;

    impl PersistTarget for FailingTarget {
        fn persist(&self, _chunk: &PersistedChunk) -> std::result::Result<(), SendableError> {
            Err("disk is full".into())
        }
    }

    fn index(dims: &[&str]) -> IncrementalIndex {
        let mut index = IncrementalIndex::try_new(sum_schema(), IndexConfig::default()).unwrap();
        for dim in dims {
            index.add(row(0, dim, 1)).unwrap();
        }
        index
    }

    #[test]
    fn test_persist_in_workers() -> Report<PersistError> {
        Report::capture(|| {
            let target = Arc::new(MemoryPersistTarget::default());
            let config = PersisterConfig {
                num_threads: 2,
                max_pending_persists: 1,
            };
            let persister = Persister::try_new(config, Arc::clone(&target) as _)?;
            let handles = (0..4)
                .map(|_| persister.submit(index(&["a", "b"])))
                .collect::<Result<Vec<_>>>()?;
            persister.flush(Duration::from_secs(10))?;
            assert_eq!(persister.pending(), 0);

            for handle in handles {
                let chunk_id = handle.chunk_id();
                assert_eq!(handle.wait(Duration::from_secs(1))?, chunk_id);
            }
            assert_eq!(target.chunks().len(), 4);
            let metrics = persister.metrics().metrics_set();
            assert_eq!(metrics.count("chunks_persisted"), Some(4));
            assert_eq!(metrics.count("rows_persisted"), Some(8));
            Ok(())
        })
    }

    #[test]
    fn test_persist_in_caller() -> Report<PersistError> {
        Report::capture(|| {
            let target = Arc::new(MemoryPersistTarget::default());
            let config = PersisterConfig {
                num_threads: 0,
                ..Default::default()
            };
            let persister = Persister::try_new(config, Arc::clone(&target) as _)?;
            let handle = persister.submit(index(&["a"]))?;
            // Persisted before the submit returns
            assert_eq!(target.chunks().len(), 1);
            assert_eq!(persister.pending(), 0);
            assert!(handle.is_done());
            handle.wait(Duration::ZERO)?;
            Ok(())
        })
    }

    #[test]
    fn test_failure_propagates() {
        let persister =
            Persister::try_new(PersisterConfig::default(), Arc::new(FailingTarget)).unwrap();
        let handle = persister.submit(index(&["a"])).unwrap();
        let chunk_id = handle.chunk_id();
        drop(handle);

        let err = persister.flush(Duration::from_secs(10)).unwrap_err();
        assert!(matches!(&err, PersistError::Persist { chunk_id: id, .. } if *id == chunk_id));
        assert_eq!(persister.metrics().failed_persists.value(), 1);
        // Failure is reported once
        persister.flush(Duration::from_secs(10)).unwrap();
    }
}
