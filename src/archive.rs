//! Toolchain support archives: fetch, optional gunzip, untar into a
//! `Directory`, memoized per URL for the life of the store.

use crate::error::{PlaygroundError, PlaygroundResult};
use crate::fetch::ByteSource;
use crate::virtual_fs::{split_path, Directory};
use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// True when the buffer starts with the gzip magic number
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
}

/// Gunzip when the magic number is present, otherwise borrow the input
pub fn maybe_decompress(bytes: &[u8]) -> std::io::Result<Cow<'_, [u8]>> {
    if !is_gzip(bytes) {
        return Ok(Cow::Borrowed(bytes));
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(Cow::Owned(out))
}

/// Parse a tar container into a tree. With `prefix`, only entries under
/// it are kept and the prefix is stripped.
pub fn parse_tar(bytes: &[u8], prefix: Option<&str>) -> std::io::Result<Directory> {
    let mut root = Directory::new();
    let mut archive = tar::Archive::new(Cursor::new(bytes));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let path = raw_path.trim_start_matches("./");
        let path = match prefix {
            Some(prefix) => match path.strip_prefix(prefix) {
                Some(rest) => rest,
                None => continue,
            },
            None => path,
        };
        let segments = split_path(path);
        if segments.is_empty() {
            continue;
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            root.ensure_dir(&segments, path).map_err(invalid_data)?;
            continue;
        }
        if !entry_type.is_file() {
            debug!(path, ?entry_type, "skipping non-file tar entry");
            continue;
        }

        // the header size is untrusted; never reserve more than the input holds
        let declared = entry.size();
        let mut data = Vec::with_capacity(declared.min(bytes.len() as u64) as usize);
        entry.read_to_end(&mut data)?;
        if data.len() as u64 != declared {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{path}: header declares {declared} bytes, archive holds {}", data.len()),
            ));
        }
        root.insert_file(path, data).map_err(invalid_data)?;
    }

    Ok(root)
}

fn invalid_data(err: PlaygroundError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}

/// Decode raw archive bytes fetched from `url`
pub fn decode_archive(url: &str, bytes: &[u8], prefix: Option<&str>) -> PlaygroundResult<Directory> {
    let format_err = |e: std::io::Error| PlaygroundError::ArchiveFormat {
        url: url.to_string(),
        reason: e.to_string(),
    };
    let tar_bytes = maybe_decompress(bytes).map_err(format_err)?;
    parse_tar(&tar_bytes, prefix).map_err(format_err)
}

type SlotKey = (String, Option<String>);

/// Process-wide (URL, prefix) → decoded root mapping. Populated once per
/// key; a failed build leaves the slot empty.
#[derive(Default)]
pub struct ArchiveCache {
    slots: Mutex<HashMap<SlotKey, Arc<OnceCell<Arc<Directory>>>>>,
}

impl ArchiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, url: &str, prefix: Option<&str>) -> Arc<OnceCell<Arc<Directory>>> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry((url.to_string(), prefix.map(str::to_string)))
            .or_default()
            .clone()
    }

    /// Cached root for `url` decoded with `prefix`, if it has been built
    pub fn get(&self, url: &str, prefix: Option<&str>) -> Option<Arc<Directory>> {
        self.slot(url, prefix).get().cloned()
    }

    pub fn len(&self) -> usize {
        let slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetches and memoizes archive roots
pub struct ArchiveStore {
    source: Arc<dyn ByteSource>,
    cache: Arc<ArchiveCache>,
}

impl ArchiveStore {
    pub fn new(source: Arc<dyn ByteSource>, cache: Arc<ArchiveCache>) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &Arc<ArchiveCache> {
        &self.cache
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    /// Root tree of the archive at `url`; the second call for the same
    /// URL and prefix returns the same `Arc` without parsing again.
    pub async fn fetch_root(&self, url: &str, prefix: Option<&str>) -> PlaygroundResult<Arc<Directory>> {
        let slot = self.cache.slot(url, prefix);
        let root = slot
            .get_or_try_init(|| async {
                let started = std::time::Instant::now();
                let bytes = self.source.fetch(url).await?;
                let gzipped = is_gzip(&bytes);
                let url_owned = url.to_string();
                let prefix_owned = prefix.map(str::to_string);
                let root = tokio::task::spawn_blocking(move || {
                    decode_archive(&url_owned, &bytes, prefix_owned.as_deref())
                })
                .await
                .map_err(|e| PlaygroundError::ArchiveFormat {
                    url: url.to_string(),
                    reason: e.to_string(),
                })??;
                info!(
                    url,
                    gzipped,
                    files = root.file_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "archive decoded"
                );
                Ok::<_, PlaygroundError>(Arc::new(root))
            })
            .await?;
        Ok(root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemorySource;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, bytes) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *bytes).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn magic_number_selects_branch() {
        let tar = tar_of(&[("a.txt", b"hi")]);
        assert!(!is_gzip(&tar));
        assert!(matches!(maybe_decompress(&tar).unwrap(), Cow::Borrowed(_)));

        let gz = gzip(&tar);
        assert!(is_gzip(&gz));
        assert_eq!(maybe_decompress(&gz).unwrap().as_ref(), tar.as_slice());
    }

    #[test]
    fn plain_and_gzipped_archives_decode_alike() {
        let tar = tar_of(&[("lib/std/std.zig", b"std"), ("lib/std/os/os.zig", b"os")]);
        let plain = decode_archive("plain", &tar, Some("lib/")).unwrap();
        let zipped = decode_archive("zipped", &gzip(&tar), Some("lib/")).unwrap();
        assert_eq!(plain, zipped);
        assert_eq!(plain.read("std/os/os.zig").unwrap(), b"os");
    }

    #[test]
    fn prefix_filters_and_strips() {
        let tar = tar_of(&[("lib/c.zig", b"c"), ("README.md", b"skip me")]);
        let root = decode_archive("zig.tar", &tar, Some("lib/")).unwrap();
        assert_eq!(root.file_paths(), vec!["c.zig".to_string()]);

        let all = decode_archive("zig.tar", &tar, None).unwrap();
        assert_eq!(all.file_paths(), vec!["README.md".to_string(), "lib/c.zig".to_string()]);
    }

    #[test]
    fn garbage_is_an_archive_format_error() {
        let err = decode_archive("bad", &gzip(b"not a tar at all, definitely"), None);
        assert!(matches!(err, Err(PlaygroundError::ArchiveFormat { .. })));

        let err = decode_archive("truncated", &[0x1F, 0x8B, 0x08], None);
        assert!(matches!(err, Err(PlaygroundError::ArchiveFormat { .. })));
    }

    #[tokio::test]
    async fn second_fetch_returns_identical_root() {
        let source = Arc::new(
            MemorySource::new().with("zx.tar.gz", gzip(&tar_of(&[("src/root.zig", b"root")]))),
        );
        let store = ArchiveStore::new(source.clone(), Arc::new(ArchiveCache::new()));

        let first = store.fetch_root("zx.tar.gz", None).await.unwrap();
        let second = store.fetch_root("zx.tar.gz", None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(store.cache().len(), 1);
    }

    #[tokio::test]
    async fn failed_decode_is_not_cached() {
        let source = Arc::new(MemorySource::new().with("zig.tar.gz", gzip(b"garbage bytes here")));
        let store = ArchiveStore::new(source.clone(), Arc::new(ArchiveCache::new()));

        assert!(store.fetch_root("zig.tar.gz", Some("lib/")).await.is_err());
        assert!(store.cache().get("zig.tar.gz", Some("lib/")).is_none());

        source.insert("zig.tar.gz", tar_of(&[("lib/std.zig", b"std")]));
        let root = store.fetch_root("zig.tar.gz", Some("lib/")).await.unwrap();
        assert_eq!(root.read("std.zig").unwrap(), b"std");
        assert_eq!(source.fetch_count(), 2);
    }

    #[test]
    fn oversized_entry_header_is_rejected() {
        let mut header = tar::Header::new_gnu();
        header.set_path("huge.bin").unwrap();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(1 << 45);
        header.set_mode(0o644);
        header.set_cksum();
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 1024]);

        let err = decode_archive("huge.tar", &bytes, None);
        assert!(matches!(err, Err(PlaygroundError::ArchiveFormat { .. })));
    }

    #[tokio::test]
    async fn each_prefix_gets_its_own_tree() {
        let source = Arc::new(
            MemorySource::new().with("zig.tar", tar_of(&[("lib/c.zig", b"c"), ("README.md", b"r")])),
        );
        let store = ArchiveStore::new(source.clone(), Arc::new(ArchiveCache::new()));

        let stripped = store.fetch_root("zig.tar", Some("lib/")).await.unwrap();
        let whole = store.fetch_root("zig.tar", None).await.unwrap();
        assert_eq!(stripped.file_paths(), vec!["c.zig".to_string()]);
        assert_eq!(whole.file_paths(), vec!["README.md".to_string(), "lib/c.zig".to_string()]);
        assert_eq!(store.cache().len(), 2);
    }
}
