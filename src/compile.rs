//! Compile stage: the compiler binary over the whole file set.

use crate::config::{self, CompileConfig};
use crate::error::{PlaygroundError, PlaygroundResult};
use crate::sandbox::{ExitStatus, SandboxBackend, SandboxInvocation, SandboxRunner};
use crate::stdio::{Channel, ChunkSender, OutputChunk, Redirect};
use crate::toolchain::Toolchain;
use crate::virtual_fs::VirtualFilesystem;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const WORK_MOUNT: &str = ".";
pub const LIB_MOUNT: &str = "/lib";
pub const CACHE_MOUNT: &str = "/cache";

/// A compile run that exited cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Artifact(Vec<u8>),
    /// Exit code 0 but the output module was never written
    NoArtifact,
}

pub struct CompileStage {
    runner: SandboxRunner,
    toolchain: Arc<Toolchain>,
    config: CompileConfig,
}

impl CompileStage {
    pub fn new(backend: Arc<dyn SandboxBackend>, toolchain: Arc<Toolchain>, config: CompileConfig) -> Self {
        Self {
            runner: SandboxRunner::new("compile", backend),
            toolchain,
            config,
        }
    }

    pub fn runner(&self) -> &SandboxRunner {
        &self.runner
    }

    pub fn artifact_name(&self) -> String {
        format!("{}.wasm", self.config.output_name)
    }

    /// Compiler argv with the entry and auxiliary module wiring
    pub fn argv(&self) -> Vec<String> {
        let c = &self.config;
        let mut argv = vec![
            self.toolchain.assets().compiler.clone(),
            "build-exe".to_string(),
            "--dep".to_string(),
            c.aux_module.clone(),
            format!("-Mroot={}", c.entry_file),
            format!("-M{}={}", c.aux_module, c.aux_entry),
            "--name".to_string(),
            c.output_name.clone(),
        ];
        argv.extend(c.flags.iter().cloned());
        argv
    }

    /// Compile `files`. Compiler output is forwarded to `diagnostics` as it
    /// is produced and also collected for the failure value.
    pub async fn compile(
        &self,
        files: &BTreeMap<String, String>,
        diagnostics: Option<&ChunkSender>,
    ) -> PlaygroundResult<CompileOutcome> {
        let started = Instant::now();
        let module = self.toolchain.compiler().await?;
        let (library, support) =
            tokio::try_join!(self.toolchain.library_root(), self.toolchain.support_root())?;

        let mounts = VirtualFilesystem::new()
            .mount_empty(WORK_MOUNT)?
            .nest(WORK_MOUNT, &self.toolchain.assets().support_dir, &support)?
            .overlay(
                WORK_MOUNT,
                files.iter().map(|(name, text)| (name.as_str(), text.as_bytes())),
            )?
            .mount_shared(LIB_MOUNT, &library)?
            .mount_empty(CACHE_MOUNT)?
            .build();

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        let forward = diagnostics.cloned();
        let collector = tokio::spawn(async move {
            let mut text = String::new();
            while let Some(chunk) = rx.recv().await {
                text.push_str(&chunk.text);
                if let Some(out) = &forward {
                    let _ = out.send(chunk);
                }
            }
            text
        });

        let invocation = SandboxInvocation::builder(module)
            .args(self.argv())
            .mounts(mounts)
            .stdout(Redirect::forward(Channel::Diagnostic, &tx))
            .stderr(Redirect::forward(Channel::Diagnostic, &tx))
            .timeout(config::timeout(self.config.timeout_secs))
            .build();
        drop(tx);

        let result = self.runner.run(invocation).await;
        let text = collector.await.unwrap_or_default();
        let report = result?;

        let outcome = match &report.status {
            ExitStatus::Exited { code: 0 } => {
                let artifact = report
                    .mounts
                    .get(WORK_MOUNT)
                    .and_then(|root| root.read(&self.artifact_name()).ok())
                    .map(<[u8]>::to_vec);
                match artifact {
                    Some(bytes) if !bytes.is_empty() => Ok(CompileOutcome::Artifact(bytes)),
                    _ => {
                        warn!(artifact = %self.artifact_name(), "compiler succeeded without output");
                        Ok(CompileOutcome::NoArtifact)
                    }
                }
            }
            ExitStatus::Exited { code } => Err(PlaygroundError::Compile {
                diagnostics: if text.trim().is_empty() {
                    format!("compiler exited with code {code}")
                } else {
                    text
                },
            }),
            status => Err(PlaygroundError::CompileCrash(
                status.trap_message().unwrap_or_default(),
            )),
        };

        info!(
            files = files.len(),
            status = ?report.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build finished"
        );
        outcome
    }
}

/// Split compiler output into display lines, dropping blanks
pub fn diagnostic_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
}
