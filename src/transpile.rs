//! Transpile stage: one sandboxed transpiler run per source file.

use crate::config::{self, TranspileConfig};
use crate::error::{PlaygroundError, PlaygroundResult};
use crate::sandbox::{ExitStatus, RunReport, SandboxBackend, SandboxInvocation, SandboxRunner};
use crate::stdio::Redirect;
use crate::toolchain::Toolchain;
use crate::virtual_fs::VirtualFilesystem;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A derived source produced by the transpiler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transpiled {
    pub source: String,
    pub filename: String,
    pub content: String,
}

pub struct TranspileStage {
    runner: SandboxRunner,
    toolchain: Arc<Toolchain>,
    config: TranspileConfig,
}

impl TranspileStage {
    pub fn new(backend: Arc<dyn SandboxBackend>, toolchain: Arc<Toolchain>, config: TranspileConfig) -> Self {
        Self {
            runner: SandboxRunner::new("transpile", backend),
            toolchain,
            config,
        }
    }

    pub fn runner(&self) -> &SandboxRunner {
        &self.runner
    }

    /// True for files carrying the source extension
    pub fn needs_transpile(&self, filename: &str) -> bool {
        self.stem(filename).is_some()
    }

    fn stem<'a>(&self, filename: &'a str) -> Option<&'a str> {
        source_stem(filename, &self.config.source_ext)
    }

    /// `Page.zx` → `Page.zig`
    pub fn derived_name(&self, filename: &str) -> Option<String> {
        self.stem(filename)
            .map(|stem| format!("{stem}.{}", self.config.target_ext))
    }

    /// Run the transpiler over a single file
    pub async fn transpile(&self, filename: &str, content: &str) -> PlaygroundResult<Transpiled> {
        let derived = self
            .derived_name(filename)
            .ok_or_else(|| PlaygroundError::Transpile {
                filename: filename.to_string(),
                stderr: format!("not a .{} file", self.config.source_ext),
            })?;
        let started = Instant::now();

        let module = self.toolchain.transpiler().await?;
        let support = self.toolchain.support_root().await?;
        let mount = self.config.mount.as_str();
        let mounts = VirtualFilesystem::new()
            .mount_empty(mount)?
            .nest(mount, &self.toolchain.assets().support_dir, &support)?
            .overlay(mount, [(filename, content.as_bytes())])?
            .build();

        let target = format!("{}/{}", mount.trim_end_matches('/'), filename);
        let invocation = SandboxInvocation::builder(module)
            .args([
                self.toolchain.assets().transpiler.clone(),
                self.config.subcommand.clone(),
                target,
            ])
            .mounts(mounts)
            .stdout(Redirect::Capture)
            .stderr(Redirect::Capture)
            .timeout(config::timeout(self.config.timeout_secs))
            .build();

        debug!(filename, "transpiling");
        let report = self.runner.run(invocation).await?;
        let result = self.read_back(filename, &derived, report);
        info!(
            filename,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transpile finished"
        );
        result
    }

    fn read_back(&self, filename: &str, derived: &str, report: RunReport) -> PlaygroundResult<Transpiled> {
        if !report.status.success() {
            return Err(PlaygroundError::Transpile {
                filename: filename.to_string(),
                stderr: failure_text(&report),
            });
        }

        let written = report
            .mounts
            .get(&self.config.mount)
            .and_then(|root| root.read(derived).ok())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        let content = match written {
            Some(content) => content,
            // some transpiler builds print the result instead of writing it
            None if !report.stdout.is_empty() => {
                warn!(filename, "no derived file written, using stdout");
                report.stdout
            }
            None => {
                return Err(PlaygroundError::Transpile {
                    filename: filename.to_string(),
                    stderr: format!("transpiler produced no {derived}"),
                })
            }
        };

        Ok(Transpiled {
            source: filename.to_string(),
            filename: derived.to_string(),
            content,
        })
    }
}

/// `Page` for `Page.zx` when `ext` is `zx`
pub fn source_stem<'a>(filename: &'a str, ext: &str) -> Option<&'a str> {
    filename
        .strip_suffix(ext)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|stem| !stem.is_empty() && !stem.ends_with('/'))
}

/// Best human-readable reason for a failed run
pub(crate) fn failure_text(report: &RunReport) -> String {
    if !report.stderr.trim().is_empty() {
        return report.stderr.clone();
    }
    match &report.status {
        ExitStatus::Exited { code } => format!("exited with code {code}"),
        status => status.trap_message().unwrap_or_default(),
    }
}
