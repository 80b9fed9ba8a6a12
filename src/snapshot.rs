//! Content-addressed snapshots of file-system locations.
//!
//! A [`Snapshot`] is an immutable tree describing one location at one point in
//! time. Its [identity](Snapshot::identity) only depends on the bytes and the
//! relative structure underneath the location, so two trees with the same
//! content hash the same no matter where they live or when they were touched.

use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::config::SymlinkPolicy;
use crate::core::Hash32;
use crate::error::SnapshotError;

const TAG_MISSING: &[u8] = b"kiln:missing";
const TAG_FILE: &[u8] = b"kiln:file";
const TAG_DIRECTORY: &[u8] = b"kiln:directory";
const TAG_SYMLINK: &[u8] = b"kiln:symlink";
const TAG_SPECIAL: &[u8] = b"kiln:special";

/// State of a single file-system location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Snapshot {
    /// Nothing exists at the location.
    Missing,
    /// A regular file.
    File(FileSnapshot),
    /// A directory and everything below it.
    Directory(DirectorySnapshot),
    /// A symbolic link recorded as such, either because links are not followed
    /// or because it dangles.
    Symlink(SymlinkSnapshot),
    /// Anything else: fifos, sockets, devices.
    Special,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// BLAKE3 of the file content.
    pub hash: Hash32,
    pub len: u64,
    /// Modification time in nanoseconds since the epoch. Informational only,
    /// it never takes part in the identity.
    pub modified: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    hash: Hash32,
    children: BTreeMap<String, Snapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymlinkSnapshot {
    pub target: Utf8PathBuf,
}

impl DirectorySnapshot {
    pub fn new(children: BTreeMap<String, Snapshot>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TAG_DIRECTORY);

        for (name, child) in &children {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(child.identity().as_bytes());
        }

        Self {
            hash: hasher.finalize().into(),
            children,
        }
    }

    pub fn children(&self) -> &BTreeMap<String, Snapshot> {
        &self.children
    }
}

impl Snapshot {
    /// Aggregate content identity of this tree.
    pub fn identity(&self) -> Hash32 {
        match self {
            Snapshot::Missing => Hash32::hash(TAG_MISSING),
            Snapshot::File(file) => tagged(TAG_FILE, file.hash.as_bytes()),
            Snapshot::Directory(dir) => dir.hash,
            Snapshot::Symlink(link) => tagged(TAG_SYMLINK, link.target.as_str().as_bytes()),
            Snapshot::Special => Hash32::hash(TAG_SPECIAL),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Snapshot::Missing)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Snapshot::Missing => "missing",
            Snapshot::File(_) => "file",
            Snapshot::Directory(_) => "directory",
            Snapshot::Symlink(_) => "symlink",
            Snapshot::Special => "special",
        }
    }

    /// Calls `visitor` for every location below `root` that is present in
    /// this snapshot, depth-first and in name order. The root itself is not
    /// visited.
    pub fn visit_descendants<F>(&self, root: &Utf8Path, visitor: &mut F)
    where
        F: FnMut(&Utf8Path, &Snapshot),
    {
        if let Snapshot::Directory(dir) = self {
            for (name, child) in &dir.children {
                let path = root.join(name);
                visitor(&path, child);
                child.visit_descendants(&path, visitor);
            }
        }
    }
}

fn tagged(tag: &[u8], bytes: &[u8]) -> Hash32 {
    blake3::Hasher::new()
        .update(tag)
        .update(bytes)
        .finalize()
        .into()
}

/// A snapshot together with the absolute location it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatedSnapshot {
    pub path: Utf8PathBuf,
    pub snapshot: Snapshot,
}

impl LocatedSnapshot {
    pub fn identity(&self) -> Hash32 {
        self.snapshot.identity()
    }
}

/// Walks file-system locations and produces [`Snapshot`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshotter {
    symlinks: SymlinkPolicy,
}

impl Snapshotter {
    pub fn new(symlinks: SymlinkPolicy) -> Self {
        Self { symlinks }
    }

    /// Captures the current state of `path`, which must be absolute.
    ///
    /// A location that does not exist yields [`Snapshot::Missing`]. Any other
    /// failure to read it, including permission errors, is returned as an
    /// error.
    pub fn snapshot(&self, path: &Utf8Path) -> Result<Snapshot, SnapshotError> {
        if !path.is_absolute() {
            return Err(SnapshotError::RelativePath(path.to_path_buf()));
        }

        self.snapshot_entry(path, &[])
    }

    pub fn snapshot_located(&self, path: &Utf8Path) -> Result<LocatedSnapshot, SnapshotError> {
        Ok(LocatedSnapshot {
            path: path.to_path_buf(),
            snapshot: self.snapshot(path)?,
        })
    }

    /// `visiting` holds the canonical directories on the way down to `path`
    /// and is only tracked when links are followed.
    fn snapshot_entry(
        &self,
        path: &Utf8Path,
        visiting: &[PathBuf],
    ) -> Result<Snapshot, SnapshotError> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::Missing),
            Err(e) => return Err(unreadable(path, e)),
        };

        if !meta.file_type().is_symlink() {
            return self.snapshot_meta(path, &meta, visiting);
        }

        match self.symlinks {
            SymlinkPolicy::Record => read_link(path),
            SymlinkPolicy::Follow => match fs::metadata(path) {
                Ok(target) if target.is_dir() && is_loop(path, visiting)? => read_link(path),
                Ok(target) => self.snapshot_meta(path, &target, visiting),
                Err(e) if e.kind() == io::ErrorKind::NotFound => read_link(path),
                Err(e) => Err(unreadable(path, e)),
            },
        }
    }

    fn snapshot_meta(
        &self,
        path: &Utf8Path,
        meta: &Metadata,
        visiting: &[PathBuf],
    ) -> Result<Snapshot, SnapshotError> {
        if meta.is_file() {
            let hash = Hash32::hash_file(path).map_err(|e| unreadable(path, e))?;
            let modified = meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|since| u64::try_from(since.as_nanos()).unwrap_or(u64::MAX));

            return Ok(Snapshot::File(FileSnapshot {
                hash,
                len: meta.len(),
                modified,
            }));
        }

        if meta.is_dir() {
            let mut names = Vec::new();

            for entry in fs::read_dir(path).map_err(|e| unreadable(path, e))? {
                let entry = entry.map_err(|e| unreadable(path, e))?;
                let name = entry
                    .file_name()
                    .into_string()
                    .map_err(|_| SnapshotError::NonUtf8Path(entry.path()))?;
                names.push(name);
            }

            let mut visiting = visiting.to_vec();
            if self.symlinks == SymlinkPolicy::Follow {
                visiting.push(fs::canonicalize(path).map_err(|e| unreadable(path, e))?);
            }

            let children = names
                .into_par_iter()
                .map(|name| {
                    let child = self.snapshot_entry(&path.join(&name), &visiting)?;
                    Ok((name, child))
                })
                .collect::<Result<BTreeMap<_, _>, SnapshotError>>()?;

            return Ok(Snapshot::Directory(DirectorySnapshot::new(children)));
        }

        Ok(Snapshot::Special)
    }
}

fn read_link(path: &Utf8Path) -> Result<Snapshot, SnapshotError> {
    let target = fs::read_link(path).map_err(|e| unreadable(path, e))?;
    let target = Utf8PathBuf::from_path_buf(target).map_err(SnapshotError::NonUtf8Path)?;
    Ok(Snapshot::Symlink(SymlinkSnapshot { target }))
}

/// A followed link to a directory already being walked would recurse forever.
fn is_loop(path: &Utf8Path, visiting: &[PathBuf]) -> Result<bool, SnapshotError> {
    let target = fs::canonicalize(path).map_err(|e| unreadable(path, e))?;
    Ok(visiting.contains(&target))
}

fn unreadable(path: &Utf8Path, source: io::Error) -> SnapshotError {
    SnapshotError::Unreadable {
        path: path.to_path_buf(),
        source,
    }
}
