//! Pipeline orchestration: transpile every eligible file, compile the
//! merged set, run the artifact. At most one run is in flight; a run
//! requested meanwhile is dropped.

use crate::compile::{diagnostic_lines, CompileStage};
use crate::config::{self, PlaygroundConfig};
use crate::error::PlaygroundResult;
use crate::execute::ExecuteStage;
use crate::protocol::{
    CompileRequest, CompileResponse, ExecuteRequest, ExecuteResponse, TranspileRequest,
    TranspileResponse,
};
use crate::sandbox::SandboxBackend;
use crate::toolchain::Toolchain;
use crate::transpile::{source_stem, TranspileStage};
use crate::wasi::WasmtimeBackend;
use crate::worker::WorkerHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Transpiling { done: usize, total: usize },
    Compiling,
    Running,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Transpile,
    Compile,
    Execute,
}

/// Everything a host needs to render a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    Status(PipelineState),
    StepStarted(Step),
    StepFinished { step: Step, ok: bool, elapsed_ms: u64 },
    /// A derived source, for hosts that mirror it as a hidden file
    Transpiled { filename: String, content: String },
    /// One line of transpiler or compiler output, or a runtime trap
    Diagnostic(String),
    Compiled { bytes: usize },
    /// One line the program wrote to stderr
    Log(String),
    /// Program stdout, passed through as produced
    Preview(String),
    Done,
}

/// The three stages, each with its own sandbox
pub struct Stages {
    pub toolchain: Arc<Toolchain>,
    pub transpile: Arc<TranspileStage>,
    pub compile: Arc<CompileStage>,
    pub execute: Arc<ExecuteStage>,
}

impl Stages {
    /// Wasmtime-backed stages over the configured assets
    pub fn from_config(config: &PlaygroundConfig) -> PlaygroundResult<Self> {
        let toolchain = Arc::new(Toolchain::from_config(config));
        let backend = |mb: u64| -> PlaygroundResult<Arc<dyn SandboxBackend>> {
            Ok(Arc::new(WasmtimeBackend::new(config::memory_limit(mb))?))
        };

        let transpile = TranspileStage::new(
            backend(config.transpile.memory_limit_mb)?,
            toolchain.clone(),
            config.transpile.clone(),
        );
        let compile = CompileStage::new(
            backend(config.compile.memory_limit_mb)?,
            toolchain.clone(),
            config.compile.clone(),
        );
        let execute = ExecuteStage::new(
            backend(config.execute.memory_limit_mb)?,
            config.execute.clone(),
            compile.artifact_name(),
        );

        Ok(Self {
            toolchain,
            transpile: Arc::new(transpile),
            compile: Arc::new(compile),
            execute: Arc::new(execute),
        })
    }
}

/// Events of one accepted run. The stream closes after the last event.
#[derive(Debug)]
pub struct PipelineRun {
    pub id: Uuid,
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl PipelineRun {
    /// Wait for the run to end and return all of its events
    pub async fn collect(mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

/// Clears the in-flight flag
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Pipeline {
    stages: Stages,
    transpile: WorkerHandle<TranspileStage>,
    compile: WorkerHandle<CompileStage>,
    execute: WorkerHandle<ExecuteStage>,
    source_ext: String,
    in_flight: Arc<AtomicBool>,
}

impl Pipeline {
    /// Start one worker per stage. Must be called inside a runtime.
    pub fn new(stages: Stages, source_ext: impl Into<String>) -> Self {
        Self {
            transpile: WorkerHandle::spawn(stages.transpile.clone()),
            compile: WorkerHandle::spawn(stages.compile.clone()),
            execute: WorkerHandle::spawn(stages.execute.clone()),
            stages,
            source_ext: source_ext.into(),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &PlaygroundConfig) -> PlaygroundResult<Self> {
        Ok(Self::new(
            Stages::from_config(config)?,
            config.transpile.source_ext.clone(),
        ))
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start a run over `files`. Returns `None`, without starting anything,
    /// while another run is in flight.
    pub fn run(&self, files: BTreeMap<String, String>) -> Option<PipelineRun> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("run already in flight, request dropped");
            return None;
        }
        let guard = InFlight(self.in_flight.clone());

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            transpile: self.transpile.clone(),
            compile: self.compile.clone(),
            execute: self.execute.clone(),
            source_ext: self.source_ext.clone(),
            events: tx,
        };

        let span = info_span!("run", run_id = %id);
        tokio::spawn(
            async move {
                let started = Instant::now();
                let tail = driver.drive(files).await;
                // a host that sees the last event may start the next run
                drop(guard);
                for event in tail {
                    driver.emit(event);
                }
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "run finished");
            }
            .instrument(span),
        );

        Some(PipelineRun { id, events: rx })
    }
}

/// Reassembles whole lines from arbitrarily split chunks
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let Some(end) = self.partial.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(end + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        diagnostic_lines(&complete).map(str::to_string).collect()
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let line = rest.trim_end_matches('\r');
        (!line.is_empty()).then(|| line.to_string())
    }
}

/// Drives one run, holding its own handles so the pipeline can be shared
struct Driver {
    transpile: WorkerHandle<TranspileStage>,
    compile: WorkerHandle<CompileStage>,
    execute: WorkerHandle<ExecuteStage>,
    source_ext: String,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl Driver {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn finish_step(&self, step: Step, started: Instant, ok: bool) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(?step, ok, elapsed_ms, "step finished");
        self.emit(PipelineEvent::StepFinished { step, ok, elapsed_ms });
    }

    fn diagnostics(&self, text: &str) -> usize {
        let mut count = 0;
        for line in diagnostic_lines(text) {
            self.emit(PipelineEvent::Diagnostic(line.to_string()));
            count += 1;
        }
        count
    }

    /// Runs until the pipeline settles and returns the events that end it
    async fn drive(&self, mut files: BTreeMap<String, String>) -> Vec<PipelineEvent> {
        if !self.transpile_all(&mut files).await {
            return errored();
        }
        let Some(artifact) = self.compile(files).await else {
            return errored();
        };
        let Some(artifact) = artifact else {
            return vec![PipelineEvent::Status(PipelineState::Idle)];
        };
        self.execute(artifact).await;
        vec![PipelineEvent::Status(PipelineState::Idle), PipelineEvent::Done]
    }

    /// Transpile eligible files one at a time, merging each derivative
    /// into `files`. False on the first failure.
    async fn transpile_all(&self, files: &mut BTreeMap<String, String>) -> bool {
        let eligible: Vec<String> = files
            .keys()
            .filter(|name| source_stem(name, &self.source_ext).is_some())
            .cloned()
            .collect();
        if eligible.is_empty() {
            return true;
        }

        let total = eligible.len();
        let started = Instant::now();
        self.emit(PipelineEvent::StepStarted(Step::Transpile));
        self.emit(PipelineEvent::Status(PipelineState::Transpiling { done: 0, total }));

        for (index, filename) in eligible.into_iter().enumerate() {
            let content = files.get(&filename).cloned().unwrap_or_default();
            match self.transpile_one(filename, content).await {
                Ok((derived, text)) => {
                    self.emit(PipelineEvent::Transpiled {
                        filename: derived.clone(),
                        content: text.clone(),
                    });
                    files.insert(derived, text);
                    self.emit(PipelineEvent::Status(PipelineState::Transpiling {
                        done: index + 1,
                        total,
                    }));
                }
                Err(stderr) => {
                    if self.diagnostics(&stderr) == 0 {
                        self.emit(PipelineEvent::Diagnostic("Transpile failed".to_string()));
                    }
                    self.finish_step(Step::Transpile, started, false);
                    return false;
                }
            }
        }
        self.finish_step(Step::Transpile, started, true);
        true
    }

    async fn transpile_one(&self, filename: String, content: String) -> Result<(String, String), String> {
        let mut replies = self
            .transpile
            .send(TranspileRequest {
                filename: filename.clone(),
                content,
            })
            .map_err(|e| e.to_string())?;

        let mut result = Err(format!("no transpile result for {filename}"));
        while let Some(response) = replies.recv().await {
            result = match response {
                TranspileResponse::Transpiled {
                    filename,
                    transpiled,
                } => Ok((filename, transpiled)),
                TranspileResponse::Failed { stderr } => Err(stderr),
            };
        }
        result
    }

    /// `None` when the build failed, `Some(None)` when it exited cleanly
    /// without an artifact.
    async fn compile(&self, files: BTreeMap<String, String>) -> Option<Option<Vec<u8>>> {
        let started = Instant::now();
        self.emit(PipelineEvent::Status(PipelineState::Compiling));
        self.emit(PipelineEvent::StepStarted(Step::Compile));

        let mut replies = match self.compile.send(CompileRequest { files }) {
            Ok(replies) => replies,
            Err(e) => {
                self.diagnostics(&e.to_string());
                self.finish_step(Step::Compile, started, false);
                return None;
            }
        };

        let mut lines = LineBuffer::default();
        let mut artifact = None;
        let mut failure = None;
        while let Some(response) = replies.recv().await {
            match response {
                CompileResponse::Stderr(text) => {
                    for line in lines.push(&text) {
                        self.emit(PipelineEvent::Diagnostic(line));
                    }
                }
                CompileResponse::Compiled(bytes) => artifact = Some(bytes),
                CompileResponse::Failed { stderr } => failure = Some(stderr),
            }
        }
        if let Some(line) = lines.finish() {
            self.emit(PipelineEvent::Diagnostic(line));
        }

        if let Some(stderr) = failure {
            if let Some(message) = stderr {
                self.diagnostics(&message);
            }
            self.emit(PipelineEvent::Diagnostic("Compilation failed.".to_string()));
            self.finish_step(Step::Compile, started, false);
            return None;
        }
        match artifact {
            Some(bytes) => {
                self.emit(PipelineEvent::Compiled { bytes: bytes.len() });
                self.finish_step(Step::Compile, started, true);
                Some(Some(bytes))
            }
            None => {
                warn!("compile produced no artifact, not running");
                self.finish_step(Step::Compile, started, false);
                Some(None)
            }
        }
    }

    async fn execute(&self, artifact: Vec<u8>) {
        let started = Instant::now();
        self.emit(PipelineEvent::Status(PipelineState::Running));
        self.emit(PipelineEvent::StepStarted(Step::Execute));

        let mut replies = match self.execute.send(ExecuteRequest { run: artifact }) {
            Ok(replies) => replies,
            Err(e) => {
                self.diagnostics(&e.to_string());
                self.finish_step(Step::Execute, started, false);
                return;
            }
        };

        let mut logs = LineBuffer::default();
        let mut trapped = false;
        while let Some(response) = replies.recv().await {
            match response {
                ExecuteResponse::Stderr(text) => {
                    for line in logs.push(&text) {
                        self.emit(PipelineEvent::Log(line));
                    }
                }
                ExecuteResponse::Preview(text) => self.emit(PipelineEvent::Preview(text)),
                ExecuteResponse::Trapped(message) => {
                    if let Some(line) = logs.finish() {
                        self.emit(PipelineEvent::Log(line));
                    }
                    self.diagnostics(&message);
                    trapped = true;
                }
                ExecuteResponse::Done => {}
            }
        }
        if let Some(line) = logs.finish() {
            self.emit(PipelineEvent::Log(line));
        }
        self.finish_step(Step::Execute, started, !trapped);
    }
}

fn errored() -> Vec<PipelineEvent> {
    vec![
        PipelineEvent::Status(PipelineState::Errored),
        PipelineEvent::Status(PipelineState::Idle),
    ]
}
