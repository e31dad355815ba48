//! Byte sources for toolchain assets and the persistent content cache
//! that lets repeat sessions skip the network.

use crate::error::{PlaygroundError, PlaygroundResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Anything that can produce the bytes behind an asset URL
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn fetch(&self, url: &str) -> PlaygroundResult<Vec<u8>>;
}

/// Pick a source for an asset base: `http(s)://` goes over the network,
/// anything else is treated as a local directory.
pub fn source_for(base: &str) -> Arc<dyn ByteSource> {
    if base.starts_with("http://") || base.starts_with("https://") {
        Arc::new(HttpSource::new(base))
    } else {
        Arc::new(DirSource::new(base))
    }
}

/// Fetch over HTTP relative to a base URL
pub struct HttpSource {
    client: reqwest::Client,
    base: String,
}

impl HttpSource {
    pub fn new(base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn fetch(&self, url: &str) -> PlaygroundResult<Vec<u8>> {
        let full = self.resolve(url);
        debug!(url = %full, "http fetch");
        let fetch_err = |reason: String| PlaygroundError::Fetch {
            url: full.clone(),
            reason,
        };

        let response = self
            .client
            .get(&full)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Read assets from a local directory
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ByteSource for DirSource {
    async fn fetch(&self, url: &str) -> PlaygroundResult<Vec<u8>> {
        let path = self.root.join(url.trim_start_matches('/'));
        tokio::fs::read(&path)
            .await
            .map_err(|e| PlaygroundError::Fetch {
                url: path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Preloaded assets held in memory. Counts fetches so callers can see
/// whether a layer above actually reached it.
#[derive(Default)]
pub struct MemorySource {
    assets: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(url, bytes);
        self
    }

    pub fn insert(&self, url: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut assets) = self.assets.lock() {
            assets.insert(url.to_string(), bytes.into());
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn fetch(&self, url: &str) -> PlaygroundResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let assets = self.assets.lock().map_err(|_| PlaygroundError::Fetch {
            url: url.to_string(),
            reason: "asset table poisoned".to_string(),
        })?;
        assets.get(url).cloned().ok_or_else(|| PlaygroundError::Fetch {
            url: url.to_string(),
            reason: "not found".to_string(),
        })
    }
}

/// On-disk byte cache keyed by URL
#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
}

impl ContentCache {
    /// Cache rooted at `<root>/<namespace>`; bumping the namespace
    /// orphans every older entry.
    pub fn new(root: &Path, namespace: &str) -> Self {
        Self {
            dir: root.join(namespace),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        self.dir.join(hex::encode(hasher.finalize()))
    }

    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.entry_path(url)).await.ok()
    }

    pub async fn put(&self, url: &str, bytes: &[u8]) -> PlaygroundResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.entry_path(url);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// A source fronted by a persistent content cache
pub struct CachedSource {
    inner: Arc<dyn ByteSource>,
    cache: Option<ContentCache>,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn ByteSource>, cache: Option<ContentCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl ByteSource for CachedSource {
    async fn fetch(&self, url: &str) -> PlaygroundResult<Vec<u8>> {
        let Some(cache) = &self.cache else {
            return self.inner.fetch(url).await;
        };

        if let Some(bytes) = cache.get(url).await {
            debug!(url, bytes = bytes.len(), "content cache hit");
            return Ok(bytes);
        }

        let bytes = self.inner.fetch(url).await?;
        info!(url, bytes = bytes.len(), "fetched");
        if let Err(e) = cache.put(url, &bytes).await {
            warn!(url, error = %e, "could not store in content cache");
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_hit_skips_inner_source() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(MemorySource::new().with("zig.wasm", b"\0asm".to_vec()));
        let cache = ContentCache::new(dir.path(), "ns-1");

        let first = CachedSource::new(inner.clone(), Some(cache.clone()));
        assert_eq!(first.fetch("zig.wasm").await.unwrap(), b"\0asm");
        assert_eq!(inner.fetch_count(), 1);

        // a new session over the same cache directory
        let second = CachedSource::new(inner.clone(), Some(cache));
        assert_eq!(second.fetch("zig.wasm").await.unwrap(), b"\0asm");
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(MemorySource::new());
        let cached = CachedSource::new(inner.clone(), Some(ContentCache::new(dir.path(), "ns")));

        assert!(matches!(
            cached.fetch("missing.tar.gz").await,
            Err(PlaygroundError::Fetch { .. })
        ));
        inner.insert("missing.tar.gz", b"late".to_vec());
        assert_eq!(cached.fetch("missing.tar.gz").await.unwrap(), b"late");
        assert_eq!(inner.fetch_count(), 2);
    }

    #[tokio::test]
    async fn dir_source_reads_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zx.wasm"), b"module").unwrap();
        let source = DirSource::new(dir.path());
        assert_eq!(source.fetch("/zx.wasm").await.unwrap(), b"module");
        assert!(source.fetch("nope.wasm").await.is_err());
    }

    #[test]
    fn http_source_joins_base() {
        let source = HttpSource::new("https://ziex.dev/assets/playground/");
        assert_eq!(
            source.resolve("zig.tar.gz"),
            "https://ziex.dev/assets/playground/zig.tar.gz"
        );
        assert_eq!(source.resolve("https://cdn/x"), "https://cdn/x");
    }
}
