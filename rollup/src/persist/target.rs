//! Implementations of the [`PersistTarget`]

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, Snafu};

use super::{PersistTarget, PersistedChunk};
use crate::error::SendableError;
use crate::row::Row;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum TargetError {
    #[snafu(display("Failed to access the file `{}`", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Malformed json in line `{line}` of the file `{}`", path.display()))]
    Json {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[snafu(display("Chunk file `{}` is empty", path.display()))]
    MissingHeader { path: PathBuf },
}

/// Keeps the chunks in memory
#[derive(Debug, Default)]
pub struct MemoryPersistTarget {
    chunks: Mutex<Vec<Arc<PersistedChunk>>>,
}

impl MemoryPersistTarget {
    /// Chunks in the order they are persisted
    pub fn chunks(&self) -> Vec<Arc<PersistedChunk>> {
        self.chunks.lock().clone()
    }
}

impl PersistTarget for MemoryPersistTarget {
    fn persist(&self, chunk: &PersistedChunk) -> Result<(), SendableError> {
        self.chunks.lock().push(Arc::new(chunk.clone()));
        Ok(())
    }
}

/// Writes each chunk into `{dir}/{chunk_id}.jsonl`. The first line is the header of
/// the chunk, each of the following lines is a row
#[derive(Debug, Clone)]
pub struct JsonLinesPersistTarget {
    dir: PathBuf,
}

impl JsonLinesPersistTarget {
    /// Extension of the chunk files
    pub const EXTENSION: &'static str = "jsonl";

    /// Create the target, the directory is created if it does not exist
    pub fn try_new(dir: impl Into<PathBuf>) -> Result<Self, TargetError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;
        Ok(Self { dir })
    }

    /// Directory of the chunk files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, chunk: &PersistedChunk) -> Result<(), TargetError> {
        let path = self
            .dir
            .join(format!("{}.{}", chunk.id, Self::EXTENSION));
        // Written into a temporary file first, readers never see a partial chunk
        let tmp = path.with_extension("tmp");
        let file = File::create(&tmp).context(IoSnafu { path: &tmp })?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer(&mut writer, chunk).context(JsonSnafu { path: &tmp, line: 0_usize })?;
        writer.write_all(b"\n").context(IoSnafu { path: &tmp })?;
        for (line, row) in chunk.rows.iter().enumerate() {
            serde_json::to_writer(&mut writer, row).context(JsonSnafu {
                path: &tmp,
                line: line + 1,
            })?;
            writer.write_all(b"\n").context(IoSnafu { path: &tmp })?;
        }
        writer.flush().context(IoSnafu { path: &tmp })?;
        std::fs::rename(&tmp, &path).context(IoSnafu { path: &path })
    }

    /// Read the chunk file
    pub fn read_chunk(path: &Path) -> Result<PersistedChunk, TargetError> {
        let file = File::open(path).context(IoSnafu { path })?;
        let mut lines = BufReader::new(file).lines().enumerate();

        let (_, header) = lines.next().context(MissingHeaderSnafu { path })?;
        let header = header.context(IoSnafu { path })?;
        let mut chunk: PersistedChunk =
            serde_json::from_str(&header).context(JsonSnafu { path, line: 0_usize })?;
        for (line, row) in lines {
            let row = row.context(IoSnafu { path })?;
            if row.trim().is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(&row).context(JsonSnafu { path, line })?;
            chunk.rows.push(row);
        }
        Ok(chunk)
    }

    /// Read all of the chunks in the directory, ordered by their file names
    pub fn read_chunks(&self) -> Result<Vec<PersistedChunk>, TargetError> {
        let mut paths = std::fs::read_dir(&self.dir)
            .context(IoSnafu { path: &self.dir })?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()
            .context(IoSnafu { path: &self.dir })?;
        paths.retain(|path| path.extension().is_some_and(|ext| ext == Self::EXTENSION));
        paths.sort();
        paths.iter().map(|path| Self::read_chunk(path)).collect()
    }
}

impl PersistTarget for JsonLinesPersistTarget {
    fn persist(&self, chunk: &PersistedChunk) -> Result<(), SendableError> {
        Ok(self.write(chunk)?)
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::common::uuid::ChunkId;
    use crate::index::IncrementalIndex;
    use crate::index::schema::IndexConfig;
    use crate::index::tests::{row, sum_schema};

    #[test]
    fn test_json_lines_round_trip() -> Report<TargetError> {
        Report::capture(|| {
            let dir = std::env::temp_dir().join(format!("rollup-{}", ChunkId::random()));
            let target = JsonLinesPersistTarget::try_new(&dir)?;

            let mut index =
                IncrementalIndex::try_new(sum_schema(), IndexConfig::default()).unwrap();
            index.add(row(0, "a", 1)).unwrap();
            index.add(row(60_000, "b", 2).with_dimension("tags", vec!["x", "y"])).unwrap();
            let chunk = PersistedChunk::from_index(ChunkId::random(), &index);
            target.write(&chunk)?;

            let chunks = target.read_chunks()?;
            assert_eq!(chunks, vec![chunk]);
            std::fs::remove_dir_all(&dir).context(IoSnafu { path: &dir })?;
            Ok(())
        })
    }

    #[test]
    fn test_missing_header() {
        let dir = std::env::temp_dir().join(format!("rollup-{}", ChunkId::random()));
        let target = JsonLinesPersistTarget::try_new(&dir).unwrap();
        let path = target.dir().join("empty.jsonl");
        File::create(&path).unwrap();
        assert!(matches!(
            target.read_chunks(),
            Err(TargetError::MissingHeader { .. })
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
