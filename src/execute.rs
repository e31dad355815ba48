//! Execute stage: runs a compiled artifact with live output.

use crate::config::{self, ExecuteConfig};
use crate::error::PlaygroundResult;
use crate::sandbox::{ExitStatus, ModuleSource, SandboxBackend, SandboxInvocation, SandboxRunner};
use crate::stdio::{Channel, ChunkSender, Redirect};
use std::sync::Arc;
use tracing::info;

pub struct ExecuteStage {
    runner: SandboxRunner,
    config: ExecuteConfig,
    program_name: String,
}

impl ExecuteStage {
    /// `program_name` becomes argv[0] of every run
    pub fn new(backend: Arc<dyn SandboxBackend>, config: ExecuteConfig, program_name: impl Into<String>) -> Self {
        Self {
            runner: SandboxRunner::new("execute", backend),
            config,
            program_name: program_name.into(),
        }
    }

    pub fn runner(&self) -> &SandboxRunner {
        &self.runner
    }

    /// Run `artifact` to completion. stdout is sent as `Preview` chunks and
    /// stderr as `Diagnostic` chunks while the program runs; the returned
    /// status tells how it ended.
    pub async fn execute(&self, artifact: Vec<u8>, output: &ChunkSender) -> PlaygroundResult<ExitStatus> {
        let invocation = SandboxInvocation::builder(ModuleSource::from_bytes(artifact))
            .args([self.program_name.clone()])
            .stdout(Redirect::forward(Channel::Preview, output))
            .stderr(Redirect::forward(Channel::Diagnostic, output))
            .entry_points(self.config.entry_points.iter().cloned())
            .timeout(config::timeout(self.config.timeout_secs))
            .build();

        let report = self.runner.run(invocation).await?;
        info!(
            status = ?report.status,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "program exited"
        );
        Ok(report.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RunReport;
    use crate::stdio::OutputSink;
    use tokio::sync::mpsc;

    /// Prints three preview fragments and a log line
    struct FakeProgram;

    impl SandboxBackend for FakeProgram {
        fn execute(&self, invocation: SandboxInvocation) -> PlaygroundResult<RunReport> {
            assert_eq!(invocation.entry_points, vec!["_start", "main"]);
            let mut stdout = OutputSink::new(invocation.stdout);
            let mut stderr = OutputSink::new(invocation.stderr);
            for part in ["<ul>", "<li>1</li>", "</ul>"] {
                stdout.write(part.as_bytes());
            }
            stderr.write(b"rendered\n");
            Ok(RunReport::new(
                ExitStatus::Exited { code: 0 },
                stdout.finish(),
                stderr.finish(),
                invocation.mounts,
            ))
        }
    }

    #[tokio::test]
    async fn output_is_tagged_by_stream() {
        let stage = ExecuteStage::new(Arc::new(FakeProgram), ExecuteConfig::default(), "main.wasm");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let status = stage.execute(b"\0asm".to_vec(), &tx).await.unwrap();
        assert!(status.success());
        drop(tx);

        let mut previews = Vec::new();
        let mut logs = Vec::new();
        while let Some(chunk) = rx.recv().await {
            match chunk.channel {
                Channel::Preview => previews.push(chunk.text),
                Channel::Diagnostic => logs.push(chunk.text),
            }
        }
        assert_eq!(previews, vec!["<ul>", "<li>1</li>", "</ul>"]);
        assert_eq!(logs, vec!["rendered\n"]);
    }
}
