use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::io::normalize_path;
use crate::snapshot::LocatedSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// The path was written by a work item, and so is everything below it.
    Output,
    /// The path is a directory with outputs somewhere below it.
    ContainsOutputs,
}

/// Registry of the locations produced by earlier executions.
///
/// Anything registered here may be deleted by the build when it goes stale.
/// Everything else belongs to the user and is never touched. New entries are
/// kept in memory until [`flush`](OutputFilesRepository::flush) or drop.
pub struct OutputFilesRepository {
    path: Utf8PathBuf,
    entries: RwLock<Entries>,
}

#[derive(Default)]
struct Entries {
    paths: BTreeMap<Utf8PathBuf, Ownership>,
    /// Entries not yet written to disk.
    dirty: bool,
}

impl Entries {
    fn register(&mut self, path: Utf8PathBuf, ownership: Ownership) {
        if self.paths.insert(path, ownership) != Some(ownership) {
            self.dirty = true;
        }
    }
}

impl OutputFilesRepository {
    pub(crate) fn open(path: Utf8PathBuf) -> Result<Self, StoreError> {
        let paths = super::load(&path)?;
        Ok(Self {
            path,
            entries: RwLock::new(Entries {
                paths,
                dirty: false,
            }),
        })
    }

    /// Whether `path` was produced by the build, either directly or as part
    /// of a registered output directory. Paths that no longer exist on disk
    /// keep their answer.
    pub fn is_generated_by_build(&self, path: &Utf8Path) -> bool {
        let path = normalize_path(path);
        let entries = self.entries.read();

        if entries.paths.contains_key(&path) {
            return true;
        }

        path.ancestors()
            .skip(1)
            .any(|ancestor| entries.paths.get(ancestor) == Some(&Ownership::Output))
    }

    /// Registers the given output locations together with everything present
    /// below them, and marks their ancestors as containing outputs.
    ///
    /// Missing locations are registered as well, so that an output removed
    /// since still counts as generated. The registry only ever grows.
    pub fn record_outputs<'a, I>(&self, outputs: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a LocatedSnapshot>,
    {
        let mut entries = self.entries.write();

        for output in outputs {
            let root = normalize_path(&output.path);

            output.snapshot.visit_descendants(&root, &mut |path, _| {
                entries.register(path.to_path_buf(), Ownership::Output);
            });

            for ancestor in root.ancestors().skip(1) {
                if entries.paths.contains_key(ancestor) {
                    break;
                }
                entries.register(ancestor.to_path_buf(), Ownership::ContainsOutputs);
            }

            entries.register(root, Ownership::Output);
        }

        Ok(())
    }

    /// Writes pending entries to disk. Does nothing when there are none.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        if !entries.dirty {
            return Ok(());
        }

        super::save(&self.path, &entries.paths)?;
        entries.dirty = false;
        Ok(())
    }

    pub fn ownership(&self, path: &Utf8Path) -> Option<Ownership> {
        self.entries.read().paths.get(&normalize_path(path)).copied()
    }

    pub fn is_dirty(&self) -> bool {
        self.entries.read().dirty
    }

    pub fn len(&self) -> usize {
        self.entries.read().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for OutputFilesRepository {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("Couldn't save the output registry: {}", e);
        }
    }
}
