//! Persistent state shared by every build session in a cache directory.
//!
//! Two files live next to each other: `history.bin` holding one
//! [`ExecutionRecord`] per work item and `outputs.bin` holding the output
//! ownership registry. Both start with a header carrying the store format
//! version and the version of the crate that wrote it. A header mismatch or an
//! undecodable file is treated as an empty store, so a format change forces a
//! full re-execution instead of a garbled read.
//!
//! Access is exclusive: opening a [`Store`] takes an advisory lock on the
//! `lock` file and holds it until the store is dropped.

mod history;
mod outputs;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use history::{ExecutionRecord, FileFingerprint, HistoryStore, InputFingerprint};
pub use outputs::{OutputFilesRepository, Ownership};

const FORMAT_VERSION: u32 = 1;
const WRITER: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const FILE_LOCK: &str = "lock";
const FILE_HISTORY: &str = "history.bin";
const FILE_OUTPUTS: &str = "outputs.bin";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    format: u32,
    writer: String,
}

impl Header {
    fn current() -> Self {
        Self {
            format: FORMAT_VERSION,
            writer: WRITER.to_string(),
        }
    }
}

#[derive(Serialize)]
struct StoreFileRef<'a, T> {
    header: Header,
    body: &'a T,
}

#[derive(Deserialize)]
struct StoreFile<T> {
    header: Header,
    body: T,
}

/// Reads a store file. Missing, undecodable and outdated files all yield the
/// default (empty) content.
pub(crate) fn load<T>(path: &Utf8Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    match ciborium::from_reader::<StoreFile<T>, _>(BufReader::new(file)) {
        Ok(file) if file.header == Header::current() => Ok(file.body),
        Ok(file) => {
            tracing::warn!(
                "Discarding {} written by {} (format {}), expected {} (format {})",
                path,
                file.header.writer,
                file.header.format,
                WRITER,
                FORMAT_VERSION,
            );
            Ok(T::default())
        }
        Err(e) => {
            tracing::warn!("Discarding unreadable {}: {}", path, e);
            Ok(T::default())
        }
    }
}

/// Writes a store file atomically.
pub(crate) fn save<T>(path: &Utf8Path, body: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let mut buffer = Vec::new();
    let file = StoreFileRef {
        header: Header::current(),
        body,
    };

    ciborium::into_writer(&file, &mut buffer).map_err(|e| StoreError::Encode {
        what: path.to_string(),
        message: e.to_string(),
    })?;

    crate::io::write_atomic(path, &buffer).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Exclusive advisory lock on a cache directory, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    dir: Utf8PathBuf,
}

impl StoreLock {
    pub(crate) fn acquire(dir: &Utf8Path) -> Result<Self, StoreError> {
        let path = dir.join(FILE_LOCK);
        let io_error = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_error)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                dir: dir.to_path_buf(),
            }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(StoreError::Locked(dir.to_path_buf()))
            }
            Err(e) => Err(io_error(e)),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Couldn't release the store lock in {}: {}", self.dir, e);
        }
    }
}

/// The persistent state of one cache directory, held exclusively.
///
/// Changes are written by [`flush`](Store::flush), or when the store is
/// dropped. Field order matters: the registry is saved before the history, so
/// an interrupted save leaves owned outputs without history rather than
/// history pointing at unowned outputs. Both happen before the lock is
/// released.
pub struct Store {
    outputs: OutputFilesRepository,
    history: HistoryStore,
    lock: StoreLock,
}

impl Store {
    /// Locks `dir` and loads both stores from it.
    pub fn open(dir: &Utf8Path) -> Result<Self, StoreError> {
        let lock = StoreLock::acquire(dir)?;
        let history = HistoryStore::open(dir.join(FILE_HISTORY))?;
        let outputs = OutputFilesRepository::open(dir.join(FILE_OUTPUTS))?;

        tracing::debug!(
            "Opened store in {} with {} history record(s)",
            dir,
            history.len()
        );

        Ok(Self {
            outputs,
            history,
            lock,
        })
    }

    /// Writes pending changes of both stores to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.outputs.flush()?;
        self.history.flush()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn outputs(&self) -> &OutputFilesRepository {
        &self.outputs
    }

    pub fn dir(&self) -> &Utf8Path {
        self.lock.dir()
    }
}
