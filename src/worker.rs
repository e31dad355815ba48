//! Stage workers. Each stage sits behind a task that is only reachable
//! through a channel; a request arriving while the worker is busy is
//! dropped, which closes its reply channel without a response. A reply
//! stream that has closed means the worker is idle again.

use crate::compile::{CompileOutcome, CompileStage};
use crate::error::{PlaygroundError, PlaygroundResult};
use crate::execute::ExecuteStage;
use crate::protocol::{
    CompileRequest, CompileResponse, ExecuteRequest, ExecuteResponse, TranspileRequest,
    TranspileResponse,
};
use crate::stdio::{Channel, OutputChunk};
use crate::transpile::TranspileStage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type Reply<T> = mpsc::UnboundedSender<T>;
pub type Replies<T> = mpsc::UnboundedReceiver<T>;

/// A stage that answers protocol requests
#[async_trait]
pub trait StageService: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    const NAME: &'static str;

    /// Handle one request, sending zero or more responses
    async fn handle(&self, request: Self::Request, reply: Reply<Self::Response>);
}

struct Envelope<S: StageService> {
    request: S::Request,
    reply: Reply<S::Response>,
}

/// Clears the busy flag when the handling task ends
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sending side of a running worker
pub struct WorkerHandle<S: StageService> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
    busy: Arc<AtomicBool>,
}

impl<S: StageService> Clone for WorkerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            busy: self.busy.clone(),
        }
    }
}

impl<S: StageService> WorkerHandle<S> {
    /// Start a worker task for `service`. Must be called inside a runtime.
    pub fn spawn(service: Arc<S>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<S>>();
        let busy = Arc::new(AtomicBool::new(false));
        let flag = busy.clone();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if flag
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    debug!(worker = S::NAME, "busy, request dropped");
                    continue;
                }
                let guard = BusyGuard(flag.clone());
                let service = service.clone();
                tokio::spawn(async move {
                    let Envelope { request, reply } = envelope;
                    // the reply stream closes only after the flag is clear
                    let last = reply.clone();
                    service.handle(request, reply).await;
                    drop(guard);
                    drop(last);
                });
            }
            debug!(worker = S::NAME, "worker stopped");
        });

        Self { tx, busy }
    }

    /// Post a request; responses arrive on the returned receiver
    pub fn send(&self, request: S::Request) -> PlaygroundResult<Replies<S::Response>> {
        let (reply, replies) = mpsc::unbounded_channel();
        self.tx
            .send(Envelope { request, reply })
            .map_err(|_| PlaygroundError::WorkerGone(S::NAME))?;
        Ok(replies)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[async_trait]
impl StageService for TranspileStage {
    type Request = TranspileRequest;
    type Response = TranspileResponse;

    const NAME: &'static str = "transpile";

    async fn handle(&self, request: TranspileRequest, reply: Reply<TranspileResponse>) {
        let response = match self.transpile(&request.filename, &request.content).await {
            Ok(out) => TranspileResponse::Transpiled {
                filename: out.filename,
                transpiled: out.content,
            },
            Err(PlaygroundError::Transpile { stderr, .. }) => TranspileResponse::Failed { stderr },
            Err(e) if e.is_busy() => return,
            Err(e) => TranspileResponse::Failed {
                stderr: e.to_string(),
            },
        };
        let _ = reply.send(response);
    }
}

#[async_trait]
impl StageService for CompileStage {
    type Request = CompileRequest;
    type Response = CompileResponse;

    const NAME: &'static str = "compile";

    async fn handle(&self, request: CompileRequest, reply: Reply<CompileResponse>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        let forward = {
            let reply = reply.clone();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let _ = reply.send(CompileResponse::Stderr(chunk.text));
                }
            })
        };

        let result = self.compile(&request.files, Some(&tx)).await;
        drop(tx);
        let _ = forward.await;

        let response = match result {
            Ok(CompileOutcome::Artifact(bytes)) => CompileResponse::Compiled(bytes),
            Ok(CompileOutcome::NoArtifact) => return,
            // the listing already went out as stderr chunks
            Err(PlaygroundError::Compile { .. }) => CompileResponse::Failed { stderr: None },
            Err(e) if e.is_busy() => return,
            Err(e) => {
                warn!(error = %e, "compile failed");
                CompileResponse::Failed {
                    stderr: Some(e.to_string()),
                }
            }
        };
        let _ = reply.send(response);
    }
}

#[async_trait]
impl StageService for ExecuteStage {
    type Request = ExecuteRequest;
    type Response = ExecuteResponse;

    const NAME: &'static str = "execute";

    async fn handle(&self, request: ExecuteRequest, reply: Reply<ExecuteResponse>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        let forward = {
            let reply = reply.clone();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let response = match chunk.channel {
                        Channel::Preview => ExecuteResponse::Preview(chunk.text),
                        Channel::Diagnostic => ExecuteResponse::Stderr(chunk.text),
                    };
                    let _ = reply.send(response);
                }
            })
        };

        let result = self.execute(request.run, &tx).await;
        drop(tx);
        let _ = forward.await;

        match result {
            Ok(status) => {
                if let Some(message) = status.trap_message() {
                    let _ = reply.send(ExecuteResponse::Trapped(message));
                }
            }
            Err(e) if e.is_busy() => return,
            Err(e) => {
                let _ = reply.send(ExecuteResponse::Trapped(e.to_string()));
            }
        }
        let _ = reply.send(ExecuteResponse::Done);
    }
}
