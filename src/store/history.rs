use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ciborium::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::StoreError;
use crate::snapshot::LocatedSnapshot;

/// Fingerprint of one named input property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputFingerprint {
    /// The property had no value.
    Absent,
    /// Digest of a scalar value.
    Value(Hash32),
    /// Snapshots of the files the property resolved to, in resolution order.
    Files(Vec<FileFingerprint>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: Utf8PathBuf,
    pub identity: Hash32,
}

impl From<&LocatedSnapshot> for FileFingerprint {
    fn from(located: &LocatedSnapshot) -> Self {
        Self {
            path: located.path.clone(),
            identity: located.identity(),
        }
    }
}

impl InputFingerprint {
    /// Single digest summarizing the property, compared between executions.
    pub fn digest(&self) -> Hash32 {
        match self {
            InputFingerprint::Absent => Hash32::hash(b"kiln:absent"),
            InputFingerprint::Value(hash) => *hash,
            InputFingerprint::Files(files) => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(b"kiln:files");
                for file in files {
                    hasher.update(&(file.path.as_str().len() as u64).to_le_bytes());
                    hasher.update(file.path.as_str().as_bytes());
                    hasher.update(file.identity.as_bytes());
                }
                hasher.finalize().into()
            }
        }
    }
}

/// Last known execution of a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub identity: String,
    /// Fingerprint of the code that ran.
    pub implementation: String,
    /// Input fingerprints in declared order.
    pub inputs: Vec<(String, InputFingerprint)>,
    /// Output snapshots in declared order, taken right after the action ran.
    pub outputs: Vec<(String, LocatedSnapshot)>,
    pub successful: bool,
}

impl ExecutionRecord {
    pub fn input(&self, name: &str) -> Option<&InputFingerprint> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn output(&self, name: &str) -> Option<&LocatedSnapshot> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

#[derive(Default)]
struct State {
    records: BTreeMap<String, Arc<ExecutionRecord>>,
    encoded: BTreeMap<String, Value>,
    /// Changes not yet written to disk.
    dirty: bool,
}

/// Execution records keyed by work item identity.
///
/// Every record is encoded on its own so a single undecodable entry only costs
/// that work item its history. Mutations apply in memory under the write lock
/// and reach the disk on [`flush`](HistoryStore::flush), which replaces the
/// whole file atomically. Dropping the store flushes it.
pub struct HistoryStore {
    path: Utf8PathBuf,
    state: RwLock<State>,
}

impl HistoryStore {
    pub(crate) fn open(path: Utf8PathBuf) -> Result<Self, StoreError> {
        let encoded: BTreeMap<String, Value> = super::load(&path)?;
        let mut state = State::default();

        for (identity, value) in encoded {
            match value.deserialized::<ExecutionRecord>() {
                Ok(record) if record.identity == identity => {
                    state.records.insert(identity.clone(), Arc::new(record));
                    state.encoded.insert(identity, value);
                }
                Ok(record) => {
                    tracing::warn!(
                        "Dropping history of '{}', it was stored as '{}'",
                        identity,
                        record.identity
                    );
                }
                Err(e) => {
                    tracing::warn!("Dropping unreadable history of '{}': {}", identity, e);
                }
            }
        }

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn get(&self, identity: &str) -> Option<Arc<ExecutionRecord>> {
        self.state.read().records.get(identity).cloned()
    }

    /// Replaces the record stored for `record.identity`.
    pub fn put(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let value = Value::serialized(&record).map_err(|e| StoreError::Encode {
            what: format!("the history of '{}'", record.identity),
            message: e.to_string(),
        })?;

        let mut state = self.state.write();
        let identity = record.identity.clone();
        state.encoded.insert(identity.clone(), value);
        state.records.insert(identity, Arc::new(record));
        state.dirty = true;
        Ok(())
    }

    /// Evicts the record of `identity`, returns whether there was one.
    pub fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();

        if state.encoded.remove(identity).is_none() {
            return Ok(false);
        }

        state.records.remove(identity);
        state.dirty = true;
        Ok(true)
    }

    /// Writes pending changes to disk. Does nothing when there are none.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(());
        }

        super::save(&self.path, &state.encoded)?;
        state.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn identities(&self) -> Vec<String> {
        self.state.read().records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("Couldn't save the execution history: {}", e);
        }
    }
}
