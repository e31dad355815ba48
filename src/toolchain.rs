//! Toolchain assets: the compiler and transpiler modules plus the two
//! archives they read. Everything is fetched at most once per store.

use crate::archive::{ArchiveCache, ArchiveStore};
use crate::config::{AssetConfig, PlaygroundConfig};
use crate::error::PlaygroundResult;
use crate::fetch::{source_for, ByteSource, CachedSource, ContentCache};
use crate::sandbox::ModuleSource;
use crate::virtual_fs::Directory;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::info;

/// Sizes of everything `warm` pulled in
#[derive(Debug, Clone, Serialize)]
pub struct WarmReport {
    pub compiler_bytes: usize,
    pub transpiler_bytes: usize,
    pub library_files: usize,
    pub support_files: usize,
}

pub struct Toolchain {
    assets: AssetConfig,
    source: Arc<dyn ByteSource>,
    archives: ArchiveStore,
    modules: Mutex<HashMap<String, Arc<OnceCell<ModuleSource>>>>,
}

impl Toolchain {
    pub fn new(assets: AssetConfig, source: Arc<dyn ByteSource>, archive_cache: Arc<ArchiveCache>) -> Self {
        Self {
            assets,
            archives: ArchiveStore::new(source.clone(), archive_cache),
            source,
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Network or directory source behind the persistent content cache
    pub fn from_config(config: &PlaygroundConfig) -> Self {
        let inner = source_for(&config.assets.base);
        let cache = config
            .cache
            .dir
            .as_deref()
            .map(|dir| ContentCache::new(dir, &config.cache.namespace));
        let source: Arc<dyn ByteSource> = Arc::new(CachedSource::new(inner, cache));
        Self::new(config.assets.clone(), source, Arc::new(ArchiveCache::new()))
    }

    pub fn assets(&self) -> &AssetConfig {
        &self.assets
    }

    pub fn archives(&self) -> &ArchiveStore {
        &self.archives
    }

    fn slot(&self, url: &str) -> Arc<OnceCell<ModuleSource>> {
        let mut modules = match self.modules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        modules.entry(url.to_string()).or_default().clone()
    }

    /// Module bytes at `url`, fetched once
    pub async fn module(&self, url: &str) -> PlaygroundResult<ModuleSource> {
        let slot = self.slot(url);
        let module = slot
            .get_or_try_init(|| async {
                let bytes = self.source.fetch(url).await?;
                let module = ModuleSource::from_bytes(bytes);
                info!(url, bytes = module.len(), key = %&module.key[..12], "module loaded");
                Ok::<_, crate::error::PlaygroundError>(module)
            })
            .await?;
        Ok(module.clone())
    }

    pub async fn compiler(&self) -> PlaygroundResult<ModuleSource> {
        self.module(&self.assets.compiler).await
    }

    pub async fn transpiler(&self) -> PlaygroundResult<ModuleSource> {
        self.module(&self.assets.transpiler).await
    }

    /// Standard library tree for the `/lib` mount
    pub async fn library_root(&self) -> PlaygroundResult<Arc<Directory>> {
        self.archives
            .fetch_root(&self.assets.library_archive, self.assets.library_prefix.as_deref())
            .await
    }

    /// Support sources nested under `support_dir` in source mounts
    pub async fn support_root(&self) -> PlaygroundResult<Arc<Directory>> {
        self.archives
            .fetch_root(&self.assets.support_archive, self.assets.support_prefix.as_deref())
            .await
    }

    /// Fetch and decode every asset up front
    pub async fn warm(&self) -> PlaygroundResult<WarmReport> {
        let (compiler, transpiler, library, support) = tokio::try_join!(
            self.compiler(),
            self.transpiler(),
            self.library_root(),
            self.support_root()
        )?;
        Ok(WarmReport {
            compiler_bytes: compiler.len(),
            transpiler_bytes: transpiler.len(),
            library_files: library.file_count(),
            support_files: support.file_count(),
        })
    }
}
