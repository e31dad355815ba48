use crate::error::{PlaygroundError, PlaygroundResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// File contents are shared between trees; writers go through `Arc::make_mut`.
pub type FileBytes = Arc<Vec<u8>>;

/// A node of the in-memory filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(FileBytes),
    Directory(Directory),
}

impl Entry {
    pub fn file(bytes: impl Into<Vec<u8>>) -> Self {
        Entry::File(Arc::new(bytes.into()))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }

    pub fn as_dir(&self) -> Option<&Directory> {
        match self {
            Entry::Directory(dir) => Some(dir),
            Entry::File(_) => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut Directory> {
        match self {
            Entry::Directory(dir) => Some(dir),
            Entry::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&[u8]> {
        match self {
            Entry::File(bytes) => Some(bytes.as_slice()),
            Entry::Directory(_) => None,
        }
    }

    /// Byte length for files, child count for directories
    pub fn size(&self) -> u64 {
        match self {
            Entry::File(bytes) => bytes.len() as u64,
            Entry::Directory(dir) => dir.len() as u64,
        }
    }
}

/// Ordered name → entry mapping. Names are unique by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<String, Entry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from a real host directory
    pub fn from_host_dir(path: &Path) -> PlaygroundResult<Self> {
        if !path.is_dir() {
            return Err(PlaygroundError::VirtualFileNotFound(path.display().to_string()));
        }

        let mut root = Self::new();
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(path) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let content = std::fs::read(entry.path())?;
            root.insert_file(&relative, content)?;
        }

        Ok(root)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Insert or replace a direct child, returning the previous entry
    pub fn insert(&mut self, name: impl Into<String>, entry: Entry) -> Option<Entry> {
        self.entries.insert(name.into(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<Entry> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Follow `segments` from this directory
    pub fn lookup<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Entry> {
        let (last, parents) = segments.split_last()?;
        let mut dir = self;
        for segment in parents {
            dir = dir.get(segment.as_ref())?.as_dir()?;
        }
        dir.get(last.as_ref())
    }

    pub fn lookup_mut<S: AsRef<str>>(&mut self, segments: &[S]) -> Option<&mut Entry> {
        let (last, parents) = segments.split_last()?;
        let mut dir = self;
        for segment in parents {
            dir = dir.get_mut(segment.as_ref())?.as_dir_mut()?;
        }
        dir.get_mut(last.as_ref())
    }

    /// Directory at `segments`; the empty path is `self`
    pub fn dir_at<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Directory> {
        if segments.is_empty() {
            return Some(self);
        }
        self.lookup(segments)?.as_dir()
    }

    pub fn dir_at_mut<S: AsRef<str>>(&mut self, segments: &[S]) -> Option<&mut Directory> {
        if segments.is_empty() {
            return Some(self);
        }
        self.lookup_mut(segments)?.as_dir_mut()
    }

    /// Read a file by slash-separated path
    pub fn read(&self, path: &str) -> PlaygroundResult<&[u8]> {
        let segments = split_path(path);
        self.lookup(&segments)
            .and_then(Entry::as_file)
            .ok_or_else(|| PlaygroundError::VirtualFileNotFound(path.to_string()))
    }

    /// Insert a file at a slash-separated path, creating intermediate
    /// directories on demand. Replacing a file with a file is allowed;
    /// a file/directory clash is a conflict.
    pub fn insert_file(&mut self, path: &str, bytes: impl Into<Vec<u8>>) -> PlaygroundResult<()> {
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(PlaygroundError::PathConflict(format!("empty path {path:?}")));
        };
        let dir = self.ensure_dir(parents, path)?;
        if matches!(dir.get(name), Some(Entry::Directory(_))) {
            return Err(PlaygroundError::PathConflict(format!(
                "{path} is a directory"
            )));
        }
        dir.insert(*name, Entry::file(bytes));
        Ok(())
    }

    /// Insert a file, replacing whatever occupies the path or its parents
    pub fn overlay_file(&mut self, path: &str, bytes: impl Into<Vec<u8>>) {
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return;
        };
        let mut dir = self;
        for segment in parents {
            let slot = dir
                .entries
                .entry(segment.to_string())
                .or_insert_with(|| Entry::Directory(Directory::new()));
            if !slot.is_dir() {
                *slot = Entry::Directory(Directory::new());
            }
            dir = match slot {
                Entry::Directory(child) => child,
                Entry::File(_) => unreachable!("slot was just made a directory"),
            };
        }
        dir.insert(*name, Entry::file(bytes));
    }

    /// Create every directory along `segments`
    pub fn ensure_dir(&mut self, segments: &[&str], path: &str) -> PlaygroundResult<&mut Directory> {
        let mut dir = self;
        for segment in segments {
            let slot = dir
                .entries
                .entry(segment.to_string())
                .or_insert_with(|| Entry::Directory(Directory::new()));
            dir = slot.as_dir_mut().ok_or_else(|| {
                PlaygroundError::PathConflict(format!("{segment} in {path} is a file"))
            })?;
        }
        Ok(dir)
    }

    /// Number of files in the whole subtree
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match entry {
                Entry::File(_) => 1,
                Entry::Directory(dir) => dir.file_count(),
            })
            .sum()
    }

    /// Every file path in the subtree, depth first
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, entry) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match entry {
                Entry::File(_) => out.push(path),
                Entry::Directory(dir) => dir.collect_paths(&path, out),
            }
        }
    }
}

/// Split on `/`, dropping empty and `.` segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}

/// A named directory tree visible to the sandbox as a preopen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub name: String,
    pub root: Directory,
}

/// Ordered preopen table; mount names are unique
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, root: Directory) -> PlaygroundResult<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(PlaygroundError::DuplicateMount(name));
        }
        self.mounts.push(Mount { name, root });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Directory> {
        self.mounts.iter().find(|m| m.name == name).map(|m| &m.root)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Directory> {
        self.mounts
            .iter_mut()
            .find(|m| m.name == name)
            .map(|m| &mut m.root)
    }

    pub fn by_index(&self, index: usize) -> Option<&Mount> {
        self.mounts.get(index)
    }

    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut Mount> {
        self.mounts.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }

    /// Remove a mount and hand back its tree
    pub fn take(&mut self, name: &str) -> Option<Directory> {
        let index = self.mounts.iter().position(|m| m.name == name)?;
        Some(self.mounts.remove(index).root)
    }
}

/// Builder for the mount table of one sandbox invocation
#[derive(Debug, Default)]
pub struct VirtualFilesystem {
    mounts: MountTable,
}

impl VirtualFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a tree at `name`
    pub fn mount(mut self, name: &str, root: Directory) -> PlaygroundResult<Self> {
        self.mounts.push(name, root)?;
        Ok(self)
    }

    /// Mount a private copy of a cached tree. File bytes stay shared.
    pub fn mount_shared(self, name: &str, root: &Arc<Directory>) -> PlaygroundResult<Self> {
        self.mount(name, Directory::clone(root))
    }

    /// Mount an empty writable directory
    pub fn mount_empty(self, name: &str) -> PlaygroundResult<Self> {
        self.mount(name, Directory::new())
    }

    /// Place `files` over the tree mounted at `name`; overlays win
    pub fn overlay<'a, I>(mut self, name: &str, files: I) -> PlaygroundResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let root = self
            .mounts
            .get_mut(name)
            .ok_or_else(|| PlaygroundError::VirtualFileNotFound(format!("mount {name}")))?;
        for (path, bytes) in files {
            root.overlay_file(path, bytes.to_vec());
        }
        Ok(self)
    }

    /// Attach a cached tree as a named subtree inside an existing mount
    pub fn nest(mut self, name: &str, at: &str, tree: &Arc<Directory>) -> PlaygroundResult<Self> {
        let root = self
            .mounts
            .get_mut(name)
            .ok_or_else(|| PlaygroundError::VirtualFileNotFound(format!("mount {name}")))?;
        let segments = split_path(at);
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(PlaygroundError::PathConflict(format!("empty nest path in {name}")));
        };
        let parent = root.ensure_dir(parents, at)?;
        parent.insert(*leaf, Entry::Directory(Directory::clone(tree)));
        Ok(self)
    }

    pub fn build(self) -> MountTable {
        self.mounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_file_creates_each_directory_once() {
        let mut root = Directory::new();
        root.insert_file("std/a.zig", b"a".to_vec()).unwrap();
        root.insert_file("std/b.zig", b"b".to_vec()).unwrap();
        root.insert_file("std/os/c.zig", b"c".to_vec()).unwrap();

        assert_eq!(root.len(), 1);
        let std_dir = root.get("std").and_then(Entry::as_dir).unwrap();
        assert_eq!(std_dir.len(), 3);
        assert_eq!(root.file_count(), 3);
        assert_eq!(root.read("std/os/c.zig").unwrap(), b"c");
    }

    #[test]
    fn file_directory_clash_is_a_conflict() {
        let mut root = Directory::new();
        root.insert_file("a", b"x".to_vec()).unwrap();
        let err = root.insert_file("a/b", b"y".to_vec()).unwrap_err();
        assert!(matches!(err, PlaygroundError::PathConflict(_)));

        root.insert_file("d/e", b"y".to_vec()).unwrap();
        let err = root.insert_file("d", b"z".to_vec()).unwrap_err();
        assert!(matches!(err, PlaygroundError::PathConflict(_)));
    }

    #[test]
    fn overlay_takes_precedence() {
        let mut base = Directory::new();
        base.insert_file("main.zig", b"archive".to_vec()).unwrap();
        let vfs = VirtualFilesystem::new()
            .mount(".", base)
            .unwrap()
            .overlay(".", [("main.zig", b"user".as_slice())])
            .unwrap()
            .build();

        assert_eq!(vfs.get(".").unwrap().read("main.zig").unwrap(), b"user");
    }

    #[test]
    fn duplicate_mount_rejected() {
        let err = VirtualFilesystem::new()
            .mount_empty("/cache")
            .unwrap()
            .mount_empty("/cache")
            .unwrap_err();
        assert!(matches!(err, PlaygroundError::DuplicateMount(name) if name == "/cache"));
    }

    #[test]
    fn nested_tree_is_a_private_copy() {
        let mut shared = Directory::new();
        shared.insert_file("src/root.zig", b"pub fn x() void {}".to_vec()).unwrap();
        let shared = Arc::new(shared);

        let mut table = VirtualFilesystem::new()
            .mount_empty(".")
            .unwrap()
            .nest(".", "zx", &shared)
            .unwrap()
            .build();

        let cwd = table.get_mut(".").unwrap();
        cwd.overlay_file("zx/src/root.zig", b"changed".to_vec());
        assert_eq!(shared.read("src/root.zig").unwrap(), b"pub fn x() void {}");
        assert_eq!(table.get(".").unwrap().read("zx/src/root.zig").unwrap(), b"changed");
    }

    #[test]
    fn from_host_dir_reads_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("main.zig"), "const a = 1;").unwrap();
        std::fs::write(dir.path().join("sub/x.zx"), "<div/>").unwrap();

        let root = Directory::from_host_dir(dir.path()).unwrap();
        assert_eq!(root.file_paths(), vec!["main.zig".to_string(), "sub/x.zx".to_string()]);
    }
}
