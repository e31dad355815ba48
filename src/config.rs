//! Playground configuration, loaded from an optional TOML file.

use crate::error::{PlaygroundError, PlaygroundResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "ziex-pg-v0.1.0-dev.678";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlaygroundConfig {
    pub assets: AssetConfig,
    pub cache: CacheConfig,
    pub transpile: TranspileConfig,
    pub compile: CompileConfig,
    pub execute: ExecuteConfig,
}

/// Where the toolchain binaries and archives live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// `http(s)://` base URL or a local directory
    pub base: String,
    pub compiler: String,
    pub transpiler: String,
    /// Standard library archive mounted at `/lib`
    pub library_archive: String,
    pub library_prefix: Option<String>,
    /// Transpiler support sources nested into the source mounts
    pub support_archive: String,
    pub support_prefix: Option<String>,
    /// Directory the support tree appears under inside source mounts
    pub support_dir: String,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            base: "assets/playground".to_string(),
            compiler: "zig.wasm".to_string(),
            transpiler: "zx.wasm".to_string(),
            library_archive: "zig.tar.gz".to_string(),
            library_prefix: Some("lib/".to_string()),
            support_archive: "zx.tar.gz".to_string(),
            support_prefix: None,
            support_dir: "zx".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Persistent content cache; `None` disables it
    pub dir: Option<PathBuf>,
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranspileConfig {
    pub subcommand: String,
    /// Files with this extension are transpiled before compiling
    pub source_ext: String,
    pub target_ext: String,
    pub mount: String,
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
}

impl Default for TranspileConfig {
    fn default() -> Self {
        Self {
            subcommand: "transpile".to_string(),
            source_ext: "zx".to_string(),
            target_ext: "zig".to_string(),
            mount: "/codes".to_string(),
            timeout_secs: 60,
            memory_limit_mb: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    pub entry_file: String,
    pub aux_module: String,
    pub aux_entry: String,
    pub output_name: String,
    pub flags: Vec<String>,
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            entry_file: "main.zig".to_string(),
            aux_module: "zx".to_string(),
            aux_entry: "zx/src/root.zig".to_string(),
            output_name: "main".to_string(),
            // native wasm backend; no LLVM, no start function
            flags: ["-fno-llvm", "-fno-lld", "-fno-ubsan-rt", "-fno-entry"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_secs: 300,
            memory_limit_mb: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteConfig {
    pub entry_points: Vec<String>,
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            entry_points: vec!["_start".to_string(), "main".to_string()],
            timeout_secs: 30,
            memory_limit_mb: 512,
        }
    }
}

/// Seconds to an optional watchdog limit; 0 disables it
pub fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Megabytes to an optional memory cap; 0 disables it
pub fn memory_limit(mb: u64) -> Option<usize> {
    (mb > 0).then(|| (mb as usize).saturating_mul(1024 * 1024))
}

impl PlaygroundConfig {
    /// Load from `path`, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> PlaygroundResult<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    PlaygroundError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> PlaygroundResult<Self> {
        toml::from_str(text).map_err(|e| PlaygroundError::Config(e.to_string()))
    }

    pub fn validate(&self) -> PlaygroundResult<()> {
        let names = [
            ("assets.compiler", &self.assets.compiler),
            ("assets.transpiler", &self.assets.transpiler),
            ("assets.library_archive", &self.assets.library_archive),
            ("assets.support_archive", &self.assets.support_archive),
            ("cache.namespace", &self.cache.namespace),
            ("transpile.subcommand", &self.transpile.subcommand),
            ("transpile.mount", &self.transpile.mount),
            ("assets.support_dir", &self.assets.support_dir),
            ("compile.entry_file", &self.compile.entry_file),
            ("compile.aux_module", &self.compile.aux_module),
            ("compile.aux_entry", &self.compile.aux_entry),
            ("compile.output_name", &self.compile.output_name),
        ];
        for (key, value) in names {
            if value.trim().is_empty() {
                return Err(PlaygroundError::Config(format!("{key} must not be empty")));
            }
        }

        for (key, ext) in [
            ("transpile.source_ext", &self.transpile.source_ext),
            ("transpile.target_ext", &self.transpile.target_ext),
        ] {
            if ext.is_empty() || ext.contains('.') || ext.contains('/') {
                return Err(PlaygroundError::Config(format!(
                    "{key} must be a bare extension, got {ext:?}"
                )));
            }
        }
        if self.transpile.source_ext == self.transpile.target_ext {
            return Err(PlaygroundError::Config(
                "transpile.source_ext and transpile.target_ext must differ".to_string(),
            ));
        }

        if self.execute.entry_points.iter().all(|name| name.is_empty()) {
            return Err(PlaygroundError::Config(
                "execute.entry_points needs at least one name".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PlaygroundConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cache.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.assets.library_prefix.as_deref(), Some("lib/"));
        assert_eq!(config.compile.flags.len(), 4);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = PlaygroundConfig::from_toml_str(
            r#"
            [assets]
            base = "https://ziex.dev/assets/playground"

            [execute]
            timeout_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.assets.base, "https://ziex.dev/assets/playground");
        assert_eq!(config.assets.compiler, "zig.wasm");
        assert_eq!(timeout(config.execute.timeout_secs), None);
        assert_eq!(timeout(config.compile.timeout_secs), Some(Duration::from_secs(300)));
    }

    #[test]
    fn dotted_extension_is_rejected() {
        let config = PlaygroundConfig::from_toml_str("[transpile]\nsource_ext = \".zx\"\n").unwrap();
        assert!(matches!(config.validate(), Err(PlaygroundError::Config(_))));
    }

    #[test]
    fn unknown_toml_is_a_config_error() {
        let err = PlaygroundConfig::from_toml_str("[compile]\ntimeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, PlaygroundError::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playground.toml");
        std::fs::write(&path, "[compile]\noutput_name = \"app\"\n").unwrap();
        let config = PlaygroundConfig::load(Some(&path)).unwrap();
        assert_eq!(config.compile.output_name, "app");
        assert!(PlaygroundConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn memory_limit_in_bytes() {
        assert_eq!(memory_limit(0), None);
        assert_eq!(memory_limit(2), Some(2 * 1024 * 1024));
    }
}
