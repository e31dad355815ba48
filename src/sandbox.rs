use crate::error::{PlaygroundError, PlaygroundResult};
use crate::stdio::Redirect;
use crate::virtual_fs::MountTable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Module bytes plus a content key for the compiled-module cache
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub key: String,
    pub bytes: Arc<Vec<u8>>,
}

impl ModuleSource {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let key = Self::compute_hash(&bytes);
        Self {
            key,
            bytes: Arc::new(bytes),
        }
    }

    fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Everything one sandboxed run needs. Built fresh per stage invocation
/// and consumed by the run.
#[derive(Debug)]
pub struct SandboxInvocation {
    pub module: ModuleSource,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub mounts: MountTable,
    pub stdout: Redirect,
    pub stderr: Redirect,
    /// Exported functions tried in order as the entry point
    pub entry_points: Vec<String>,
    pub timeout: Option<Duration>,
}

impl SandboxInvocation {
    pub fn builder(module: ModuleSource) -> InvocationBuilder {
        InvocationBuilder {
            invocation: SandboxInvocation {
                module,
                args: Vec::new(),
                env: Vec::new(),
                mounts: MountTable::new(),
                stdout: Redirect::Discard,
                stderr: Redirect::Discard,
                entry_points: vec!["_start".to_string()],
                timeout: None,
            },
        }
    }
}

/// Builder for `SandboxInvocation`
#[derive(Debug)]
pub struct InvocationBuilder {
    invocation: SandboxInvocation,
}

impl InvocationBuilder {
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invocation.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invocation.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn mounts(mut self, mounts: MountTable) -> Self {
        self.invocation.mounts = mounts;
        self
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.invocation.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.invocation.stderr = redirect;
        self
    }

    pub fn entry_points<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invocation.entry_points = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation.timeout = timeout;
        self
    }

    pub fn build(self) -> SandboxInvocation {
        self.invocation
    }
}

/// How a sandboxed run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Returned from the entry point or called `proc_exit`
    Exited { code: i32 },
    /// Trapped or failed inside the module
    Trapped { message: String },
    /// Stopped by the watchdog
    TimedOut { after_ms: u64 },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited { code } => Some(*code),
            _ => None,
        }
    }

    /// Text describing an abnormal end, if any
    pub fn trap_message(&self) -> Option<String> {
        match self {
            ExitStatus::Exited { .. } => None,
            ExitStatus::Trapped { message } => Some(message.clone()),
            ExitStatus::TimedOut { after_ms } => {
                Some(format!("execution timed out after {after_ms} ms"))
            }
        }
    }
}

/// Result of a completed sandboxed run
#[derive(Debug)]
pub struct RunReport {
    pub id: String,
    pub status: ExitStatus,
    /// Text captured from stdout when redirected to `Capture`
    pub stdout: String,
    /// Text captured from stderr when redirected to `Capture`
    pub stderr: String,
    /// The mount trees as the program left them
    pub mounts: MountTable,
    pub executed_at: i64,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn new(status: ExitStatus, stdout: String, stderr: String, mounts: MountTable) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status,
            stdout,
            stderr,
            mounts,
            executed_at: chrono::Utc::now().timestamp(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Executes one invocation to completion. Implementations are blocking;
/// `SandboxRunner` moves them off the async scheduler.
pub trait SandboxBackend: Send + Sync + 'static {
    /// Errors are for failures before the module starts (compile,
    /// instantiate). Anything after start is reported in `ExitStatus`.
    fn execute(&self, invocation: SandboxInvocation) -> PlaygroundResult<RunReport>;
}

/// Admission state of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Idle,
    Running,
}

/// Resets the runner to `Idle` when the run ends, however it ends
struct RunGuard {
    state: Arc<Mutex<StageState>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            *state = StageState::Idle;
        }
    }
}

/// Runner status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub name: String,
    pub state: StageState,
    pub run_count: usize,
    pub rejected_count: usize,
}

/// One stage's sandbox runner; at most one run at a time
pub struct SandboxRunner {
    name: &'static str,
    backend: Arc<dyn SandboxBackend>,
    state: Arc<Mutex<StageState>>,
    counters: Mutex<(usize, usize)>,
}

impl SandboxRunner {
    pub fn new(name: &'static str, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            name,
            backend,
            state: Arc::new(Mutex::new(StageState::Idle)),
            counters: Mutex::new((0, 0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> StageState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(StageState::Running)
    }

    /// Idle → Running, or `Busy` if a run is active
    fn admit(&self) -> PlaygroundResult<RunGuard> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PlaygroundError::Busy(self.name))?;
        if *state == StageState::Running {
            drop(state);
            self.bump(false);
            debug!(stage = self.name, "run rejected, stage busy");
            return Err(PlaygroundError::Busy(self.name));
        }
        *state = StageState::Running;
        drop(state);
        self.bump(true);
        Ok(RunGuard {
            state: self.state.clone(),
        })
    }

    fn bump(&self, admitted: bool) {
        if let Ok(mut counters) = self.counters.lock() {
            if admitted {
                counters.0 += 1;
            } else {
                counters.1 += 1;
            }
        }
    }

    /// Run an invocation to completion on a blocking thread
    pub async fn run(&self, invocation: SandboxInvocation) -> PlaygroundResult<RunReport> {
        let guard = self.admit()?;
        let backend = self.backend.clone();
        let started = Instant::now();

        // the guard travels with the work so a dropped caller cannot
        // release the stage while the sandbox is still running
        let result = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            backend.execute(invocation)
        })
        .await
        .map_err(|e| PlaygroundError::Instantiate(format!("sandbox thread failed: {e}")))?;

        let mut report = result?;
        report.elapsed = started.elapsed();
        info!(
            stage = self.name,
            status = ?report.status,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "sandbox run finished"
        );
        Ok(report)
    }

    pub fn status(&self) -> RunnerStatus {
        let (run_count, rejected_count) = self.counters.lock().map(|c| *c).unwrap_or((0, 0));
        RunnerStatus {
            name: self.name.to_string(),
            state: self.state(),
            run_count,
            rejected_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Blocks until released so a second run can arrive mid-flight
    struct GateBackend {
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl SandboxBackend for GateBackend {
        fn execute(&self, invocation: SandboxInvocation) -> PlaygroundResult<RunReport> {
            let _ = self.release.lock().unwrap().recv();
            Ok(RunReport::new(
                ExitStatus::Exited { code: 0 },
                String::new(),
                String::new(),
                invocation.mounts,
            ))
        }
    }

    fn invocation() -> SandboxInvocation {
        SandboxInvocation::builder(ModuleSource::from_bytes(b"\0asm".to_vec()))
            .args(["tool.wasm"])
            .build()
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_first_is_active() {
        let (release, gate) = mpsc::channel();
        let runner = Arc::new(SandboxRunner::new(
            "compile",
            Arc::new(GateBackend {
                release: Mutex::new(gate),
            }),
        ));

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(invocation()).await })
        };
        while runner.state() != StageState::Running {
            tokio::task::yield_now().await;
        }

        let second = runner.run(invocation()).await;
        assert!(matches!(second, Err(PlaygroundError::Busy("compile"))));

        release.send(()).unwrap();
        let report = first.await.unwrap().unwrap();
        assert!(report.status.success());
        assert_eq!(runner.state(), StageState::Idle);

        let status = runner.status();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.rejected_count, 1);
    }

    #[test]
    fn module_key_is_content_addressed() {
        let a = ModuleSource::from_bytes(b"same".to_vec());
        let b = ModuleSource::from_bytes(b"same".to_vec());
        let c = ModuleSource::from_bytes(b"other".to_vec());
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert_eq!(a.key.len(), 64);
    }

    #[test]
    fn exit_status_helpers() {
        assert!(ExitStatus::Exited { code: 0 }.success());
        assert!(!ExitStatus::Exited { code: 1 }.success());
        assert_eq!(ExitStatus::Exited { code: 3 }.code(), Some(3));
        assert_eq!(
            ExitStatus::TimedOut { after_ms: 5 }.trap_message().unwrap(),
            "execution timed out after 5 ms"
        );
    }
}
