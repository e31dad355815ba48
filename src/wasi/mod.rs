//! wasmtime-backed sandbox: a preview1 host over in-memory mounts,
//! compiled-module cache, memory cap and a wall-clock watchdog.

pub mod abi;
pub mod host;
pub mod syscalls;

use crate::error::{PlaygroundError, PlaygroundResult};
use crate::sandbox::{ExitStatus, ModuleSource, RunReport, SandboxBackend, SandboxInvocation};
use host::WasiHost;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};

/// Data owned by each wasmtime store
pub struct StoreState {
    pub host: WasiHost,
    limits: StoreLimits,
}

/// Raised by `proc_exit` to unwind the guest with an exit code
#[derive(Debug, thiserror::Error)]
#[error("guest exited with code {0}")]
pub struct ProcExit(pub i32);

/// Compiled modules keyed by content hash
#[derive(Default)]
pub struct ModuleCache {
    modules: Mutex<HashMap<String, Module>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, engine: &Engine, source: &ModuleSource) -> PlaygroundResult<Module> {
        if let Some(module) = self.lookup(&source.key) {
            return Ok(module);
        }

        let started = std::time::Instant::now();
        let module = Module::new(engine, source.bytes.as_slice())
            .map_err(|e| PlaygroundError::Instantiate(format!("{e:#}")))?;
        info!(
            key = %&source.key[..12.min(source.key.len())],
            bytes = source.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "module compiled"
        );

        if let Ok(mut modules) = self.modules.lock() {
            modules.insert(source.key.clone(), module.clone());
        }
        Ok(module)
    }

    fn lookup(&self, key: &str) -> Option<Module> {
        self.modules.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bumps the engine epoch once `limit` elapses unless dropped first
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(engine: Engine, limit: Duration) -> Self {
        let (cancel, fired) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = fired.recv_timeout(limit) {
                warn!(limit_ms = limit.as_millis() as u64, "watchdog interrupting guest");
                engine.increment_epoch();
            }
        });
        Self {
            cancel: Some(cancel),
            handle: Some(handle),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct WasmtimeBackend {
    engine: Engine,
    linker: Linker<StoreState>,
    modules: ModuleCache,
    memory_limit: Option<usize>,
}

impl WasmtimeBackend {
    /// `memory_limit` caps each guest's linear memory in bytes
    pub fn new(memory_limit: Option<usize>) -> PlaygroundResult<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(instantiate_error)?;

        let mut linker = Linker::new(&engine);
        syscalls::add_to_linker(&mut linker).map_err(instantiate_error)?;

        Ok(Self {
            engine,
            linker,
            modules: ModuleCache::new(),
            memory_limit,
        })
    }

    /// Compile ahead of the first run
    pub fn precompile(&self, source: &ModuleSource) -> PlaygroundResult<()> {
        self.modules.get_or_compile(&self.engine, source).map(|_| ())
    }

    pub fn cached_modules(&self) -> usize {
        self.modules.len()
    }

    fn limits(&self) -> StoreLimits {
        let builder = StoreLimitsBuilder::new();
        match self.memory_limit {
            Some(bytes) => builder.memory_size(bytes).build(),
            None => builder.build(),
        }
    }
}

fn instantiate_error(err: anyhow::Error) -> PlaygroundError {
    PlaygroundError::Instantiate(format!("{err:#}"))
}

/// Turn an error out of the guest call into an exit status
fn classify(err: anyhow::Error, timeout: Option<Duration>) -> ExitStatus {
    if let Some(exit) = err.downcast_ref::<ProcExit>() {
        return ExitStatus::Exited { code: exit.0 };
    }
    if matches!(err.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
        return ExitStatus::TimedOut {
            after_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
        };
    }
    ExitStatus::Trapped {
        message: format!("{err:#}"),
    }
}

impl SandboxBackend for WasmtimeBackend {
    fn execute(&self, invocation: SandboxInvocation) -> PlaygroundResult<RunReport> {
        let module = self.modules.get_or_compile(&self.engine, &invocation.module)?;
        let SandboxInvocation {
            args,
            env,
            mounts,
            stdout,
            stderr,
            entry_points,
            timeout,
            ..
        } = invocation;

        let mut host = WasiHost::new(args, env, mounts, stdout, stderr);
        if let Some(bytes) = self.memory_limit {
            // file contents live on the host heap, so they share the cap
            host.set_file_budget(bytes as u64);
        }
        let mut store = Store::new(
            &self.engine,
            StoreState {
                host,
                limits: self.limits(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);

        let mut linker = self.linker.clone();
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(instantiate_error)?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(instantiate_error)?;

        let entry = entry_points.iter().find_map(|name| {
            instance
                .get_typed_func::<(), ()>(&mut store, name)
                .ok()
                .map(|func| (name, func))
        });

        let status = match entry {
            None => ExitStatus::Trapped {
                message: format!("module exports none of {}", entry_points.join(", ")),
            },
            Some((name, func)) => {
                let limit = timeout.filter(|limit| !limit.is_zero());
                store
                    .data_mut()
                    .host
                    .set_deadline(limit.map(|limit| Instant::now() + limit));
                let _watchdog = limit.map(|limit| Watchdog::arm(self.engine.clone(), limit));
                debug!(entry = %name, "calling entry point");
                match func.call(&mut store, ()) {
                    Ok(()) => ExitStatus::Exited { code: 0 },
                    Err(err) => classify(err, timeout),
                }
            }
        };

        let (stdout, stderr, mounts) = store.into_data().host.finish();
        Ok(RunReport::new(status, stdout, stderr, mounts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::Redirect;
    use crate::virtual_fs::VirtualFilesystem;

    const HELLO: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 16) "hello\n")
          (func (export "_start")
            (i32.store (i32.const 0) (i32.const 16))
            (i32.store (i32.const 4) (i32.const 6))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
    "#;

    fn module(wat: &str) -> ModuleSource {
        ModuleSource::from_bytes(wat.as_bytes().to_vec())
    }

    fn backend() -> WasmtimeBackend {
        WasmtimeBackend::new(None).unwrap()
    }

    #[test]
    fn stdout_reaches_the_redirect() {
        let report = backend()
            .execute(
                SandboxInvocation::builder(module(HELLO))
                    .stdout(Redirect::Capture)
                    .build(),
            )
            .unwrap();
        assert_eq!(report.status, ExitStatus::Exited { code: 0 });
        assert_eq!(report.stdout, "hello\n");
    }

    #[test]
    fn positional_write_to_stdout_is_espipe() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "fd_pwrite"
                (func $fd_pwrite (param i32 i32 i32 i64 i32) (result i32)))
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (memory (export "memory") 1)
              (func (export "_start")
                (call $proc_exit
                  (call $fd_pwrite (i32.const 1) (i32.const 0) (i32.const 0) (i64.const 0) (i32.const 8)))))
        "#;
        let report = backend()
            .execute(SandboxInvocation::builder(module(wat)).build())
            .unwrap();
        assert_eq!(report.status, ExitStatus::Exited { code: 70 });
    }

    #[test]
    fn guest_creates_files_in_a_preopen() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "path_open"
                (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (data (i32.const 64) "main.wasm")
              (data (i32.const 96) "\00asm")
              (func (export "_start")
                (drop (call $path_open (i32.const 3) (i32.const 0) (i32.const 64) (i32.const 9)
                  (i32.const 1) (i64.const 0) (i64.const 0) (i32.const 0) (i32.const 32)))
                (i32.store (i32.const 0) (i32.const 96))
                (i32.store (i32.const 4) (i32.const 4))
                (drop (call $fd_write (i32.load (i32.const 32)) (i32.const 0) (i32.const 1) (i32.const 8)))))
        "#;
        let mounts = VirtualFilesystem::new().mount_empty(".").unwrap().build();
        let report = backend()
            .execute(SandboxInvocation::builder(module(wat)).mounts(mounts).build())
            .unwrap();
        assert!(report.status.success());
        assert_eq!(report.mounts.get(".").unwrap().read("main.wasm").unwrap(), b"\0asm");
    }

    #[test]
    fn proc_exit_code_is_reported() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (func (export "_start") (call $proc_exit (i32.const 3))))
        "#;
        let report = backend()
            .execute(SandboxInvocation::builder(module(wat)).build())
            .unwrap();
        assert_eq!(report.status.code(), Some(3));
    }

    #[test]
    fn trap_is_reported_not_raised() {
        let wat = r#"(module (func (export "_start") unreachable))"#;
        let report = backend()
            .execute(SandboxInvocation::builder(module(wat)).build())
            .unwrap();
        let message = report.status.trap_message().unwrap();
        assert!(message.contains("unreachable"), "{message}");
    }

    #[test]
    fn runaway_guest_is_interrupted() {
        let wat = r#"(module (func (export "_start") (loop $spin (br $spin))))"#;
        let report = backend()
            .execute(
                SandboxInvocation::builder(module(wat))
                    .timeout(Some(Duration::from_millis(50)))
                    .build(),
            )
            .unwrap();
        assert_eq!(report.status, ExitStatus::TimedOut { after_ms: 50 });
    }

    #[test]
    fn sleeping_guest_is_interrupted() {
        // one relative monotonic clock subscription of 3s at offset 0
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "poll_oneoff"
                (func $poll_oneoff (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "_start")
                (i32.store (i32.const 16) (i32.const 1))
                (i64.store (i32.const 24) (i64.const 3000000000))
                (drop (call $poll_oneoff (i32.const 0) (i32.const 64) (i32.const 1) (i32.const 128)))))
        "#;
        let started = std::time::Instant::now();
        let report = backend()
            .execute(
                SandboxInvocation::builder(module(wat))
                    .timeout(Some(Duration::from_millis(100)))
                    .build(),
            )
            .unwrap();
        assert_eq!(report.status, ExitStatus::TimedOut { after_ms: 100 });
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn random_get_past_memory_is_fault() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "random_get"
                (func $random_get (param i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (memory (export "memory") 1)
              (func (export "_start")
                (call $proc_exit (call $random_get (i32.const 65000) (i32.const -1)))))
        "#;
        let report = backend()
            .execute(SandboxInvocation::builder(module(wat)).build())
            .unwrap();
        assert_eq!(report.status, ExitStatus::Exited { code: 21 });
    }

    #[test]
    fn file_growth_counts_against_the_memory_cap() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "path_open"
                (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "fd_filestat_set_size"
                (func $set_size (param i32 i64) (result i32)))
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (memory (export "memory") 1)
              (data (i32.const 64) "big.bin")
              (func (export "_start")
                (drop (call $path_open (i32.const 3) (i32.const 0) (i32.const 64) (i32.const 7)
                  (i32.const 1) (i64.const 0) (i64.const 0) (i32.const 0) (i32.const 32)))
                (call $proc_exit
                  (call $set_size (i32.load (i32.const 32)) (i64.const 1099511627776)))))
        "#;
        let capped = WasmtimeBackend::new(Some(128 * 1024)).unwrap();
        let mounts = VirtualFilesystem::new().mount_empty(".").unwrap().build();
        let report = capped
            .execute(SandboxInvocation::builder(module(wat)).mounts(mounts).build())
            .unwrap();
        assert_eq!(report.status, ExitStatus::Exited { code: 22 });
        assert_eq!(report.mounts.get(".").unwrap().read("big.bin").unwrap(), b"");
    }

    #[test]
    fn entry_points_are_tried_in_order() {
        let wat = r#"(module (func (export "main")))"#;
        let backend = backend();

        let missing = backend
            .execute(SandboxInvocation::builder(module(wat)).build())
            .unwrap();
        assert_eq!(
            missing.status.trap_message().unwrap(),
            "module exports none of _start"
        );

        let found = backend
            .execute(
                SandboxInvocation::builder(module(wat))
                    .entry_points(["_start", "main"])
                    .build(),
            )
            .unwrap();
        assert!(found.status.success());
        assert_eq!(backend.cached_modules(), 1);
    }

    #[test]
    fn unknown_imports_trap_only_when_called() {
        let wat = r#"
            (module
              (import "env" "missing" (func $missing))
              (func (export "_start")))
        "#;
        let report = backend()
            .execute(SandboxInvocation::builder(module(wat)).build())
            .unwrap();
        assert!(report.status.success());
    }

    #[test]
    fn invalid_module_fails_before_start() {
        let err = backend()
            .execute(SandboxInvocation::builder(ModuleSource::from_bytes(b"\0asm\x02".to_vec())).build())
            .unwrap_err();
        assert!(matches!(err, PlaygroundError::Instantiate(_)));
    }

    #[test]
    fn memory_cap_is_enforced_at_instantiation() {
        let wat = r#"(module (memory (export "memory") 4) (func (export "_start")))"#;
        let capped = WasmtimeBackend::new(Some(64 * 1024)).unwrap();
        let err = capped
            .execute(SandboxInvocation::builder(module(wat)).build())
            .unwrap_err();
        assert!(matches!(err, PlaygroundError::Instantiate(_)));
    }
}
