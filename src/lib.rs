//! ZX Playground - sandboxed transpile, compile and run pipeline
//!
//! Runs the ZX transpiler and the Zig compiler as WebAssembly modules inside
//! an in-memory WASI sandbox, then runs the compiled program the same way,
//! streaming its output back as events.
//!
//! # Features
//!
//! - **Archive Store**: tar / tar.gz toolchain archives decoded once into in-memory trees
//! - **Virtual Filesystem**: layered mounts with per-invocation file overlays
//! - **Sandbox Runner**: wasmtime with a WASI host confined to its mounts, live stdio and a watchdog
//! - **Stages**: transpile, compile and execute, each behind its own worker
//! - **Pipeline**: one run at a time, fail-fast, reported as a stream of events
//!
//! # Quick Start
//!
//! ```no_run
//! use zx_playground::{FileSet, Pipeline, PlaygroundConfig};
//!
//! # async fn demo() -> zx_playground::PlaygroundResult<()> {
//! let pipeline = Pipeline::from_config(&PlaygroundConfig::default())?;
//! let files = FileSet::from_iter([("main.zig", "pub fn main() void {}")]);
//!
//! if let Some(run) = pipeline.run(files.snapshot()) {
//!     for event in run.collect().await {
//!         println!("{event:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod compile;
pub mod config;
pub mod error;
pub mod execute;
pub mod fetch;
pub mod file_set;
pub mod pipeline;
pub mod protocol;
pub mod sandbox;
pub mod stdio;
pub mod toolchain;
pub mod transpile;
pub mod virtual_fs;
pub mod wasi;
pub mod worker;

// Re-export main types
pub use archive::{ArchiveCache, ArchiveStore};
pub use compile::{CompileOutcome, CompileStage};
pub use config::PlaygroundConfig;
pub use error::{PlaygroundError, PlaygroundResult};
pub use execute::ExecuteStage;
pub use file_set::FileSet;
pub use pipeline::{Pipeline, PipelineEvent, PipelineRun, PipelineState, Stages, Step};
pub use sandbox::{ExitStatus, RunReport, SandboxBackend, SandboxInvocation, SandboxRunner};
pub use stdio::{Channel, OutputChunk, Redirect};
pub use toolchain::Toolchain;
pub use transpile::{TranspileStage, Transpiled};
pub use virtual_fs::{Directory, Entry, MountTable, VirtualFilesystem};
pub use wasi::WasmtimeBackend;
