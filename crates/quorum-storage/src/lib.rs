//! CSV-backed persistence layer for the quorum simulation.
//!
//! The required output is one `cycle,cells` row per simulation cycle. Rows
//! are buffered and written in batches; [`CsvStorage`] does the writing on
//! the caller's thread, while [`StoragePipeline`] moves it onto a background
//! worker fed through an `mpsc` channel so the simulation loop never blocks
//! on disk.

use quorum_core::{CycleSummary, WorldPersistence};
use serde::Serialize;
use std::{
    fs::File,
    path::Path,
    sync::{Arc, Mutex, mpsc},
    thread,
};
use thiserror::Error;

const DEFAULT_ROW_BUFFER: usize = 64;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
}

/// Row written per cycle: the cycle number and the live cell count.
#[derive(Debug, Clone, Serialize)]
struct CycleRow {
    cycle: u64,
    cells: usize,
}

/// Synchronous CSV sink with buffered writes.
pub struct CsvStorage {
    writer: csv::Writer<File>,
    buffer: Vec<CycleRow>,
    flush_threshold: usize,
}

impl CsvStorage {
    /// Create or truncate the output file with the default buffering
    /// threshold. The header row is emitted with the first flush.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_threshold(path, DEFAULT_ROW_BUFFER)
    }

    /// Create or truncate the output file with an explicit flush threshold.
    pub fn with_threshold(
        path: impl AsRef<Path>,
        flush_threshold: usize,
    ) -> Result<Self, StorageError> {
        let file = File::create(path)?;
        Ok(Self {
            writer: csv::Writer::from_writer(file),
            buffer: Vec::new(),
            flush_threshold: flush_threshold.max(1),
        })
    }

    /// Queue one cycle's row, flushing once the threshold is reached.
    pub fn persist(&mut self, summary: &CycleSummary) -> Result<(), StorageError> {
        self.buffer.push(CycleRow {
            cycle: summary.cycle.0,
            cells: summary.cells,
        });
        if self.buffer.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Force buffered rows to disk.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        for row in self.buffer.drain(..) {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for CsvStorage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            eprintln!("failed to flush cycle rows on drop: {err}");
        }
    }
}

impl WorldPersistence for CsvStorage {
    fn on_cycle(&mut self, summary: &CycleSummary) {
        if let Err(err) = self.persist(summary) {
            eprintln!("failed to persist cycle {}: {err}", summary.cycle.0);
        }
    }
}

#[derive(Debug)]
enum StorageCommand {
    Persist(CycleSummary),
    Flush,
    Shutdown,
}

/// Asynchronous persistence pipeline: summaries are handed to a background
/// worker thread that owns the CSV writes.
pub struct StoragePipeline {
    tx: mpsc::Sender<StorageCommand>,
    storage: Arc<Mutex<CsvStorage>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StoragePipeline {
    /// Create a pipeline writing to `path` with default buffering.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_storage(CsvStorage::create(path)?)
    }

    /// Create a pipeline with an explicit flush threshold.
    pub fn with_threshold(
        path: impl AsRef<Path>,
        flush_threshold: usize,
    ) -> Result<Self, StorageError> {
        Self::from_storage(CsvStorage::with_threshold(path, flush_threshold)?)
    }

    fn from_storage(storage: CsvStorage) -> Result<Self, StorageError> {
        let shared = Arc::new(Mutex::new(storage));
        let (tx, rx) = mpsc::channel::<StorageCommand>();
        let worker_storage = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("quorum-storage-worker".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        StorageCommand::Persist(summary) => match worker_storage.lock() {
                            Ok(mut storage) => {
                                if let Err(err) = storage.persist(&summary) {
                                    eprintln!(
                                        "failed to persist cycle {} asynchronously: {err}",
                                        summary.cycle.0
                                    );
                                }
                            }
                            Err(poisoned) => {
                                eprintln!(
                                    "storage mutex poisoned while persisting cycle {}",
                                    summary.cycle.0
                                );
                                let mut storage = poisoned.into_inner();
                                if let Err(err) = storage.persist(&summary) {
                                    eprintln!(
                                        "failed to persist cycle {} after poison: {err}",
                                        summary.cycle.0
                                    );
                                }
                            }
                        },
                        StorageCommand::Flush => {
                            if let Ok(mut storage) = worker_storage.lock()
                                && let Err(err) = storage.flush()
                            {
                                eprintln!("failed to flush storage: {err}");
                            }
                        }
                        StorageCommand::Shutdown => {
                            if let Ok(mut storage) = worker_storage.lock() {
                                let _ = storage.flush();
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn storage worker thread: {err}"))
            })?;

        Ok(Self {
            tx,
            storage: shared,
            handle: Some(handle),
        })
    }

    /// Shared access to the underlying storage.
    #[must_use]
    pub fn storage(&self) -> Arc<Mutex<CsvStorage>> {
        Arc::clone(&self.storage)
    }

    /// Request an immediate flush of buffered rows.
    pub fn flush(&self) {
        let _ = self.tx.send(StorageCommand::Flush);
    }
}

impl WorldPersistence for StoragePipeline {
    fn on_cycle(&mut self, summary: &CycleSummary) {
        if self
            .tx
            .send(StorageCommand::Persist(summary.clone()))
            .is_err()
        {
            eprintln!(
                "storage worker channel closed; cycle {} dropped",
                summary.cycle.0
            );
        }
    }
}

impl Drop for StoragePipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(StorageCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            eprintln!("storage worker thread panicked: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::Cycle;
    use std::fs;

    fn sample_summary(cycle: u64, cells: usize) -> CycleSummary {
        CycleSummary {
            cycle: Cycle(cycle),
            cells,
            luminescent: 0,
            dark: cells,
            food: 0,
            hormones: 0,
            births: 0,
            deaths: 0,
        }
    }

    #[test]
    fn rows_are_written_with_header() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cycles.csv");
        let mut storage = CsvStorage::with_threshold(&path, 1)?;
        storage.persist(&sample_summary(1, 50))?;
        storage.persist(&sample_summary(2, 49))?;
        storage.flush()?;
        drop(storage);

        let contents = fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["cycle,cells", "1,50", "2,49"]);
        Ok(())
    }

    #[test]
    fn buffered_rows_flush_on_drop() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cycles.csv");
        let mut storage = CsvStorage::with_threshold(&path, 1_000)?;
        storage.persist(&sample_summary(1, 10))?;
        drop(storage);

        let contents = fs::read_to_string(&path)?;
        assert!(contents.contains("1,10"));
        Ok(())
    }
}
