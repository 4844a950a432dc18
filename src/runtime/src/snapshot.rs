//! Filesystem snapshots and the layer codec.
//!
//! A [`Snapshot`] is an in-memory image of a directory tree keyed by
//! relative path (`"etc/hosts"`, never a leading slash). Diffing two
//! snapshots yields a [`LayerDiff`], which encodes to a deterministic tar
//! archive: entries are sorted, timestamps and ownership are zeroed, and
//! deletions are recorded as `.wh.<name>` whiteout files.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use dockyard_core::error::{EngineError, Result};
use dockyard_core::Digest;
use serde::{Deserialize, Serialize};

const WHITEOUT_PREFIX: &str = ".wh.";

/// A single filesystem object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File { data: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
    Symlink { target: String },
}

impl Entry {
    pub fn file(data: impl Into<Vec<u8>>) -> Self {
        Entry::File {
            data: data.into(),
            mode: 0o644,
        }
    }

    pub fn dir() -> Self {
        Entry::Dir { mode: 0o755 }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir { .. })
    }

    fn size(&self) -> u64 {
        match self {
            Entry::File { data, .. } => data.len() as u64,
            _ => 0,
        }
    }
}

/// Kind of change reported by [`Snapshot::changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Single-letter code as printed by `diff` (A/C/D).
    pub fn code(self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'C',
            ChangeKind::Deleted => 'D',
        }
    }
}

/// One changed path, absolute as seen inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
}

/// An in-memory directory tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Entry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `layers` in order on top of an empty tree.
    pub fn compose<'a>(layers: impl IntoIterator<Item = &'a LayerDiff>) -> Self {
        let mut snapshot = Self::new();
        for layer in layers {
            snapshot.apply(layer);
        }
        snapshot
    }

    pub fn entries(&self) -> &BTreeMap<String, Entry> {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of regular file content.
    pub fn size(&self) -> u64 {
        self.entries.values().map(Entry::size).sum()
    }

    /// Insert an entry, creating missing parent directories.
    ///
    /// Replacing a directory with a non-directory drops everything below it.
    pub fn insert(&mut self, path: &str, entry: Entry) {
        if path.is_empty() {
            return;
        }
        for parent in ancestors(path) {
            match self.entries.get(parent) {
                Some(Entry::Dir { .. }) => {}
                Some(_) => {
                    self.remove(parent);
                    self.entries.insert(parent.to_string(), Entry::dir());
                }
                None => {
                    self.entries.insert(parent.to_string(), Entry::dir());
                }
            }
        }
        if !entry.is_dir() {
            self.remove_descendants(path);
        }
        self.entries.insert(path.to_string(), entry);
    }

    /// Remove an entry and everything below it. Returns whether it existed.
    pub fn remove(&mut self, path: &str) -> bool {
        self.remove_descendants(path);
        self.entries.remove(path).is_some()
    }

    fn remove_descendants(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.entries.remove(&key);
        }
    }

    /// Apply a layer on top of this tree: deletions first, then additions.
    pub fn apply(&mut self, layer: &LayerDiff) {
        for path in &layer.deletes {
            self.remove(path);
        }
        for (path, entry) in &layer.puts {
            self.insert(path, entry.clone());
        }
    }

    /// Changes that turn `self` into `after`.
    ///
    /// Deleting a directory is recorded once; its descendants are implied.
    pub fn diff(&self, after: &Snapshot) -> LayerDiff {
        let mut diff = LayerDiff::default();

        for (path, entry) in &after.entries {
            if self.entries.get(path) != Some(entry) {
                diff.puts.insert(path.clone(), entry.clone());
            }
        }

        // Keys are sorted, so a deleted directory is seen before its children
        for path in self.entries.keys() {
            if after.entries.contains_key(path)
                || ancestors(path).any(|a| diff.deletes.contains(a))
            {
                continue;
            }
            diff.deletes.insert(path.clone());
        }

        diff
    }

    /// Per-path change list between `self` and `after`, sorted by path.
    pub fn changes(&self, after: &Snapshot) -> Vec<Change> {
        let diff = self.diff(after);
        let mut changes: Vec<Change> = diff
            .puts
            .keys()
            .map(|path| Change {
                kind: if self.entries.contains_key(path) {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Added
                },
                path: format!("/{}", path),
            })
            .chain(diff.deletes.iter().map(|path| Change {
                kind: ChangeKind::Deleted,
                path: format!("/{}", path),
            }))
            .collect();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }

    /// Reset `paths` to their state in `base`, hiding them from a diff.
    pub fn mask(&mut self, base: &Snapshot, paths: &[String]) {
        for path in paths {
            self.remove(path);
            let prefix = format!("{}/", path);
            for (key, entry) in &base.entries {
                if key == path || key.starts_with(&prefix) {
                    self.entries.insert(key.clone(), entry.clone());
                }
            }
        }
    }

    /// Copy a host file or directory into the tree.
    ///
    /// A file lands at `dst`, or inside it when `dst` ends with `/` or is an
    /// existing directory. A directory's contents are merged into `dst`.
    pub fn copy_in(&mut self, src: &Path, dst: &str) -> Result<()> {
        let meta = std::fs::symlink_metadata(src).map_err(|e| {
            EngineError::Other(format!("cannot read {}: {}", src.display(), e))
        })?;
        let dst_key = normalize_path("/", dst)?;

        if meta.is_dir() {
            let source = Snapshot::capture(src)?;
            if !dst_key.is_empty() {
                let mode = meta.mode() & 0o7777;
                self.insert(&dst_key, Entry::Dir { mode });
            }
            for (path, entry) in source.entries {
                self.insert(&join_key(&dst_key, &path), entry);
            }
            return Ok(());
        }

        let into_dir = dst.ends_with('/')
            || dst_key.is_empty()
            || matches!(self.entries.get(&dst_key), Some(Entry::Dir { .. }));
        let target = if into_dir {
            let name = src
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| EngineError::Other(format!("invalid source {}", src.display())))?;
            join_key(&dst_key, name)
        } else {
            dst_key
        };
        self.insert(&target, read_entry(src, &meta)?);
        Ok(())
    }

    /// Record the tree rooted at `root`. Sockets and devices are skipped.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut snapshot = Self::new();
        walk_dir(root, root, &mut snapshot.entries)?;
        Ok(snapshot)
    }

    /// Write the tree under `root`, which is created if missing.
    pub fn materialize(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;
        for (path, entry) in &self.entries {
            let full = root.join(path);
            match entry {
                Entry::Dir { .. } => std::fs::create_dir_all(&full)?,
                Entry::File { data, mode } => {
                    std::fs::write(&full, data)?;
                    std::fs::set_permissions(&full, std::fs::Permissions::from_mode(*mode))?;
                }
                Entry::Symlink { target } => {
                    if std::fs::symlink_metadata(&full).is_ok() {
                        std::fs::remove_file(&full)?;
                    }
                    std::os::unix::fs::symlink(target, &full)?;
                }
            }
        }
        // Directory modes last so read-only dirs don't block their children
        for (path, entry) in self.entries.iter().rev() {
            if let Entry::Dir { mode } = entry {
                std::fs::set_permissions(root.join(path), std::fs::Permissions::from_mode(*mode))?;
            }
        }
        Ok(())
    }
}

/// Additions and deletions that turn one snapshot into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDiff {
    pub puts: BTreeMap<String, Entry>,
    pub deletes: BTreeSet<String>,
}

impl LayerDiff {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    /// Encode as a tar archive. Same diff, same bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        enum Item<'a> {
            Put(&'a Entry),
            Whiteout,
        }

        let mut items: Vec<(String, Item<'_>)> = self
            .puts
            .iter()
            .map(|(path, entry)| (path.clone(), Item::Put(entry)))
            .collect();
        for path in &self.deletes {
            items.push((whiteout_path(path), Item::Whiteout));
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));

        let mut builder = tar::Builder::new(Vec::new());
        for (path, item) in items {
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            match item {
                Item::Put(Entry::File { data, mode }) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, &path, data.as_slice())?;
                }
                Item::Put(Entry::Dir { mode }) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(*mode);
                    header.set_size(0);
                    builder.append_data(&mut header, &path, std::io::empty())?;
                }
                Item::Put(Entry::Symlink { target }) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder.append_link(&mut header, &path, target)?;
                }
                Item::Whiteout => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(0o644);
                    header.set_size(0);
                    builder.append_data(&mut header, &path, std::io::empty())?;
                }
            }
        }
        Ok(builder.into_inner()?)
    }

    /// Decode a layer archive produced by [`encode`](Self::encode).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut diff = LayerDiff::default();
        let mut archive = tar::Archive::new(data);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let raw = entry.path()?.to_string_lossy().into_owned();
            let path = normalize_path("/", raw.trim_end_matches('/'))
                .map_err(|e| corrupt(format!("bad path '{}': {}", raw, e)))?;
            if path.is_empty() {
                continue;
            }

            let (parent, name) = split_key(&path);
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                if !hidden.is_empty() && !hidden.starts_with(WHITEOUT_PREFIX) {
                    diff.deletes.insert(join_key(parent, hidden));
                }
                continue;
            }

            let mode = entry.header().mode()? & 0o7777;
            let item = match entry.header().entry_type() {
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data)?;
                    Entry::File { data, mode }
                }
                tar::EntryType::Directory => Entry::Dir { mode },
                tar::EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| corrupt(format!("symlink '{}' has no target", path)))?;
                    Entry::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    }
                }
                other => {
                    return Err(corrupt(format!(
                        "unsupported entry type {:?} at '{}'",
                        other, path
                    )))
                }
            };
            diff.puts.insert(path, item);
        }

        Ok(diff)
    }

    /// Encode and hash in one step.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of(&self.encode()?))
    }
}

/// Content digest of a host file or directory tree, for cache keys.
pub fn content_digest(path: &Path) -> Result<Digest> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| {
        EngineError::Other(format!("cannot read {}: {}", path.display(), e))
    })?;
    let mut diff = LayerDiff::default();
    if meta.is_dir() {
        diff.puts = Snapshot::capture(path)?.entries;
    } else {
        diff.puts.insert("_".to_string(), read_entry(path, &meta)?);
    }
    diff.digest()
}

/// Resolve `path` against `cwd` into a snapshot key.
///
/// `..` never climbs above the root; the root itself is `""`.
pub fn normalize_path(cwd: &str, path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(EngineError::Other("path contains NUL".to_string()));
    }
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd, path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

fn join_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn split_key(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

fn whiteout_path(path: &str) -> String {
    let (parent, name) = split_key(path);
    join_key(parent, &format!("{}{}", WHITEOUT_PREFIX, name))
}

/// Proper ancestors of a key, outermost first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

fn corrupt(message: String) -> EngineError {
    EngineError::SerializationError(format!("corrupt layer: {}", message))
}

fn read_entry(path: &Path, meta: &std::fs::Metadata) -> Result<Entry> {
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path)?;
        return Ok(Entry::Symlink {
            target: target.to_string_lossy().into_owned(),
        });
    }
    Ok(Entry::File {
        data: std::fs::read(path)?,
        mode: meta.mode() & 0o7777,
    })
}

fn walk_dir(root: &Path, current: &Path, entries: &mut BTreeMap<String, Entry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        EngineError::Other(format!(
            "failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .ok()
            .and_then(|p| p.to_str())
            .ok_or_else(|| {
                EngineError::Other(format!("unsupported file name {}", path.display()))
            })?
            .to_string();

        let meta = std::fs::symlink_metadata(&path)?;
        let file_type = meta.file_type();
        if file_type.is_dir() {
            entries.insert(
                relative,
                Entry::Dir {
                    mode: meta.mode() & 0o7777,
                },
            );
            walk_dir(root, &path, entries)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            entries.insert(relative, read_entry(&path, &meta)?);
        } else {
            tracing::debug!(path = %path.display(), "Skipping special file");
        }
    }

    Ok(())
}
