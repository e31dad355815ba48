//! The editable project: filename to source text, plus the set of files
//! that are transpiler output rather than user edits.

use crate::error::PlaygroundResult;
use crate::virtual_fs::Directory;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: BTreeMap<String, String>,
    hidden: BTreeSet<String>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every UTF-8 file under `path`. Binary files are skipped.
    pub fn from_dir(path: &Path) -> PlaygroundResult<Self> {
        let tree = Directory::from_host_dir(path)?;
        let mut set = Self::new();
        for name in tree.file_paths() {
            let bytes = tree.read(&name)?;
            match std::str::from_utf8(bytes) {
                Ok(text) => set.add(name, text),
                Err(_) => warn!(file = %name, "skipping non-UTF-8 file"),
            }
        }
        debug!(dir = %path.display(), files = set.len(), "project loaded");
        Ok(set)
    }

    /// Insert or replace a file
    pub fn add(&mut self, name: impl Into<String>, content: impl Into<String>) {
        let name = name.into();
        self.hidden.remove(&name);
        self.files.insert(name, content.into());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.hidden.remove(name);
        self.files.remove(name).is_some()
    }

    /// Fails when `from` is missing or `to` is taken
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if from == to || self.files.contains_key(to) {
            return false;
        }
        let Some(content) = self.files.remove(from) else {
            return false;
        };
        if self.hidden.remove(from) {
            self.hidden.insert(to.to_string());
        }
        self.files.insert(to.to_string(), content);
        true
    }

    /// Replace the content of an existing file only
    pub fn update(&mut self, name: &str, content: impl Into<String>) -> bool {
        match self.files.get_mut(name) {
            Some(slot) => {
                *slot = content.into();
                true
            }
            None => false,
        }
    }

    /// Record transpiler output as a hidden file
    pub fn mirror_transpiled(&mut self, name: impl Into<String>, content: impl Into<String>) {
        let name = name.into();
        self.files.insert(name.clone(), content.into());
        self.hidden.insert(name);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden.contains(name)
    }

    /// Files in name order, hidden ones included
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Files the user edits, in name order
    pub fn visible(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(name, _)| !self.hidden.contains(*name))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Independent copy of the current contents for one run
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.files.clone()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FileSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, content) in iter {
            set.add(name, content);
        }
        set
    }
}
