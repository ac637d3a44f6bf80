//! Foreground driver of the ingestion

use std::sync::Arc;
use std::time::{Duration, Instant};

use snafu::ResultExt;

use super::{IndexSnafu, PersistHandle, Persister, Result};
use crate::common::uuid::ChunkId;
use crate::index::IncrementalIndex;
use crate::index::schema::{IncrementalIndexSchema, IndexConfig};
use crate::row::InputRow;

/// Outcome of appending a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Row is aggregated, the index has `groups` groups
    Appended {
        /// Number of the groups of the current index
        groups: usize,
    },
    /// Row has malformed values and is skipped
    Invalid,
}

/// Appends the rows into the current index. When the index is full, it is handed to
/// the persister and replaced with a fresh index that inherits the dimension order
#[derive(Debug)]
pub struct Appender {
    index: IncrementalIndex,
    persister: Arc<Persister>,
    /// Chunks in the order they are submitted
    chunk_ids: Vec<ChunkId>,
    /// Handles of the persists that are not completed yet
    handles: Vec<PersistHandle>,
    invalid_rows: u64,
}

impl Appender {
    /// Create an appender with an empty index
    pub fn try_new(
        schema: IncrementalIndexSchema,
        config: IndexConfig,
        persister: Arc<Persister>,
    ) -> Result<Self> {
        Ok(Self {
            index: IncrementalIndex::try_new(schema, config).context(IndexSnafu)?,
            persister,
            chunk_ids: Vec::new(),
            handles: Vec::new(),
            invalid_rows: 0,
        })
    }

    /// Current index
    pub fn index(&self) -> &IncrementalIndex {
        &self.index
    }

    /// Number of the skipped rows
    pub fn invalid_rows(&self) -> u64 {
        self.invalid_rows
    }

    /// Append the row, the full index is persisted and the row is retried once
    pub fn add(&mut self, row: InputRow) -> Result<AppendOutcome> {
        match self.index.add(row.clone()) {
            Ok(groups) => Ok(AppendOutcome::Appended { groups }),
            Err(e) if e.is_parse_error() => self.skip(e),
            Err(e) if e.is_size_exceeded() => {
                self.persist()?;
                match self.index.add(row) {
                    Ok(groups) => Ok(AppendOutcome::Appended { groups }),
                    Err(e) if e.is_parse_error() => self.skip(e),
                    Err(e) => Err(e).context(IndexSnafu),
                }
            }
            Err(e) => Err(e).context(IndexSnafu),
        }
    }

    fn skip(&mut self, e: crate::index::IndexError) -> Result<AppendOutcome> {
        tracing::debug!("Skip the invalid row: {e}");
        self.invalid_rows += 1;
        Ok(AppendOutcome::Invalid)
    }

    /// Hand the current index to the persister if it is not empty. Blocks if the
    /// queue of the persister is full
    pub fn persist(&mut self) -> Result<()> {
        if self.index.is_empty() {
            return Ok(());
        }
        let successor = self.index.try_successor().context(IndexSnafu)?;
        let full = std::mem::replace(&mut self.index, successor);
        tracing::info!(
            "Swap the index `{}` with `{}` groups for the index `{}`",
            full.id(),
            full.len(),
            self.index.id()
        );
        let handle = self.persister.submit(full)?;
        self.chunk_ids.push(handle.chunk_id());
        self.handles.push(handle);
        self.reap()
    }

    /// Drop the handles of the completed persists, returns the first failure of them
    fn reap(&mut self) -> Result<()> {
        for handle in std::mem::take(&mut self.handles) {
            if handle.is_done() {
                handle.wait(Duration::ZERO)?;
            } else {
                self.handles.push(handle);
            }
        }
        Ok(())
    }

    /// Persist the current index and wait for all of the persists. Returns the chunks
    /// in the order they are submitted
    pub fn finish(mut self, timeout: Duration) -> Result<Vec<ChunkId>> {
        self.persist()?;
        let deadline = Instant::now() + timeout;
        for handle in self.handles.drain(..) {
            handle.wait(deadline.saturating_duration_since(Instant::now()))?;
        }
        Ok(self.chunk_ids)
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::index::tests::{row, sum_schema};
    use crate::persist::{MemoryPersistTarget, PersistError, PersisterConfig};
    use crate::selector::ParsePolicy;

    #[test]
    fn test_swap_full_index() -> Report<PersistError> {
        Report::capture(|| {
            let target = Arc::new(MemoryPersistTarget::default());
            let persister = Arc::new(Persister::try_new(
                PersisterConfig::default(),
                Arc::clone(&target) as _,
            )?);
            let config = IndexConfig::default()
                .with_max_rows(2)
                .with_parse_policy(ParsePolicy::Strict);
            let mut appender = Appender::try_new(sum_schema(), config, persister)?;

            assert_eq!(
                appender.add(row(0, "a", 1))?,
                AppendOutcome::Appended { groups: 1 }
            );
            appender.add(row(0, "b", 1))?;
            appender.add(row(0, "a", 1))?;
            // Third group goes into the successor
            assert_eq!(
                appender.add(row(0, "c", 1))?,
                AppendOutcome::Appended { groups: 1 }
            );
            assert_eq!(appender.index().dimension_order(), vec!["dim"]);
            let malformed = InputRow::new(0).with_column("v", "many");
            assert_eq!(appender.add(malformed)?, AppendOutcome::Invalid);
            assert_eq!(appender.invalid_rows(), 1);

            let chunk_ids = appender.finish(Duration::from_secs(10))?;
            let chunks = target.chunks();
            assert_eq!(chunk_ids.len(), 2);
            let mut persisted = chunks.iter().map(|chunk| chunk.id).collect::<Vec<_>>();
            persisted.sort();
            let mut expect = chunk_ids.clone();
            expect.sort();
            assert_eq!(persisted, expect);

            let rows = chunks.iter().map(|chunk| chunk.rows.len()).sum::<usize>();
            assert_eq!(rows, 3);
            Ok(())
        })
    }

    #[test]
    fn test_completed_handles_are_dropped() -> Report<PersistError> {
        Report::capture(|| {
            let target = Arc::new(MemoryPersistTarget::default());
            let config = PersisterConfig {
                num_threads: 0,
                ..Default::default()
            };
            let persister = Arc::new(Persister::try_new(config, Arc::clone(&target) as _)?);
            let config = IndexConfig::default().with_max_rows(1);
            let mut appender = Appender::try_new(sum_schema(), config, persister)?;
            for i in 0..10 {
                appender.add(row(0, &format!("d{i}"), 1))?;
                assert!(appender.handles.is_empty());
            }
            assert_eq!(target.chunks().len(), 9);

            let chunk_ids = appender.finish(Duration::from_secs(10))?;
            assert_eq!(chunk_ids.len(), 10);
            let persisted = target.chunks().iter().map(|chunk| chunk.id).collect::<Vec<_>>();
            assert_eq!(persisted, chunk_ids);
            Ok(())
        })
    }
}
