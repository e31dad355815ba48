use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use zx_playground::config::AssetConfig;
use zx_playground::fetch::MemorySource;
use zx_playground::stdio::OutputSink;
use zx_playground::{
    ArchiveCache, ArchiveStore, CompileStage, ExecuteStage, ExitStatus, Pipeline, PipelineEvent,
    PipelineState, PlaygroundConfig, PlaygroundResult, RunReport, SandboxBackend,
    SandboxInvocation, Stages, Step, Toolchain, TranspileStage,
};

fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, bytes) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *bytes).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn assets() -> Arc<MemorySource> {
    Arc::new(
        MemorySource::new()
            .with("zig.wasm", b"\0asm-compiler".to_vec())
            .with("zx.wasm", b"\0asm-transpiler".to_vec())
            .with(
                "zig.tar.gz",
                gzip(&tar_of(&[("lib/std/std.zig", b"pub const std = 1;")])),
            )
            .with("zx.tar.gz", tar_of(&[("src/root.zig", b"pub const zx = 1;")])),
    )
}

/// Stands in for all three modules, dispatching on argv[0]. Source text
/// drives the behavior: `malformed` fails transpiling, `compile_error`
/// fails the build, `no_artifact` exits cleanly without output, `trap`
/// traps at runtime and `preview3` writes three preview fragments.
#[derive(Default)]
struct Scripted {
    log: Mutex<Vec<String>>,
}

impl Scripted {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn calls(&self, program: &str) -> usize {
        self.log()
            .iter()
            .filter(|line| line.starts_with(program) && !line.ends_with(" end"))
            .count()
    }

    fn record(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }

    fn transpiler(&self, invocation: SandboxInvocation) -> RunReport {
        let target = invocation.args[2].clone();
        let name = target.trim_start_matches("/codes/").to_string();
        self.record(format!("zx.wasm {name}"));

        let mut mounts = invocation.mounts;
        let codes = mounts.get_mut("/codes").unwrap();
        let input = String::from_utf8(codes.read(&name).unwrap().to_vec()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut stderr = OutputSink::new(invocation.stderr);
        let status = if input.contains("malformed") {
            stderr.write(format!("{name}:1:5: error: expected '>'\n").as_bytes());
            ExitStatus::Exited { code: 1 }
        } else {
            let derived = name.replace(".zx", ".zig");
            codes
                .insert_file(&derived, format!("pub const markup = \"{input}\";"))
                .unwrap();
            ExitStatus::Exited { code: 0 }
        };
        self.record(format!("zx.wasm {name} end"));
        RunReport::new(status, String::new(), stderr.finish(), mounts)
    }

    fn compiler(&self, invocation: SandboxInvocation) -> RunReport {
        let mut mounts = invocation.mounts;
        let cwd = mounts.get_mut(".").unwrap();
        let files: Vec<String> = cwd
            .file_paths()
            .into_iter()
            .filter(|path| !path.starts_with("zx/"))
            .collect();
        self.record(format!("zig.wasm {}", files.join(",")));

        let main = String::from_utf8(cwd.read("main.zig").unwrap().to_vec()).unwrap();
        let mut stderr = OutputSink::new(invocation.stderr);
        let status = if main.contains("compile_error") {
            stderr.write(b"main.zig:3:9: error: expected ';' after ");
            stderr.write(b"statement\n    const x = 1\n");
            ExitStatus::Exited { code: 1 }
        } else {
            if !main.contains("no_artifact") {
                let mut artifact = b"\0asm".to_vec();
                artifact.extend_from_slice(main.as_bytes());
                cwd.insert_file("main.wasm", artifact).unwrap();
            }
            ExitStatus::Exited { code: 0 }
        };
        RunReport::new(status, String::new(), stderr.finish(), mounts)
    }

    fn program(&self, invocation: SandboxInvocation) -> RunReport {
        self.record("main.wasm".to_string());
        let script = String::from_utf8_lossy(&invocation.module.bytes).into_owned();
        let mut stdout = OutputSink::new(invocation.stdout);
        let mut stderr = OutputSink::new(invocation.stderr);

        stderr.write(b"starting\n");
        if script.contains("preview3") {
            for part in ["<p>1</p>", "<p>2</p>", "<p>3</p>"] {
                stdout.write(part.as_bytes());
            }
        }
        let status = if script.contains("trap") {
            ExitStatus::Trapped {
                message: "wasm trap: integer divide by zero".to_string(),
            }
        } else {
            ExitStatus::Exited { code: 0 }
        };
        RunReport::new(status, stdout.finish(), stderr.finish(), invocation.mounts)
    }
}

impl SandboxBackend for Scripted {
    fn execute(&self, invocation: SandboxInvocation) -> PlaygroundResult<RunReport> {
        let report = match invocation.args[0].as_str() {
            "zx.wasm" => self.transpiler(invocation),
            "zig.wasm" => self.compiler(invocation),
            "main.wasm" => self.program(invocation),
            other => panic!("unexpected program {other}"),
        };
        Ok(report)
    }
}

fn pipeline() -> (Pipeline, Arc<Scripted>, Arc<MemorySource>) {
    let source = assets();
    let backend = Arc::new(Scripted::default());
    let config = PlaygroundConfig::default();
    let toolchain = Arc::new(Toolchain::new(
        AssetConfig::default(),
        source.clone(),
        Arc::new(ArchiveCache::new()),
    ));

    let stages = Stages {
        toolchain: toolchain.clone(),
        transpile: Arc::new(TranspileStage::new(
            backend.clone(),
            toolchain.clone(),
            config.transpile.clone(),
        )),
        compile: Arc::new(CompileStage::new(
            backend.clone(),
            toolchain,
            config.compile.clone(),
        )),
        execute: Arc::new(ExecuteStage::new(
            backend.clone(),
            config.execute.clone(),
            "main.wasm",
        )),
    };
    (Pipeline::new(stages, "zx"), backend, source)
}

fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(name, text)| (name.to_string(), text.to_string()))
        .collect()
}

fn count(events: &[PipelineEvent], wanted: &PipelineEvent) -> usize {
    events.iter().filter(|event| *event == wanted).count()
}

#[tokio::test]
async fn plain_zig_project_skips_transpile_and_runs() {
    let (pipeline, backend, _) = pipeline();
    let events = pipeline
        .run(files(&[("main.zig", "pub fn main() void {} // preview3")]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(backend.calls("zx.wasm"), 0);
    assert_eq!(backend.calls("zig.wasm"), 1);
    assert_eq!(backend.calls("main.wasm"), 1);
    assert!(!events.contains(&PipelineEvent::StepStarted(Step::Transpile)));
    assert!(events.contains(&PipelineEvent::Log("starting".to_string())));
    assert_eq!(events.last(), Some(&PipelineEvent::Done));
    assert_eq!(count(&events, &PipelineEvent::Done), 1);
}

#[tokio::test]
async fn preview_chunks_arrive_in_order_before_done() {
    let (pipeline, _, _) = pipeline();
    let events = pipeline
        .run(files(&[("main.zig", "preview3")]))
        .unwrap()
        .collect()
        .await;

    let tail: Vec<&PipelineEvent> = events
        .iter()
        .filter(|event| matches!(event, PipelineEvent::Preview(_) | PipelineEvent::Done))
        .collect();
    assert_eq!(
        tail,
        vec![
            &PipelineEvent::Preview("<p>1</p>".to_string()),
            &PipelineEvent::Preview("<p>2</p>".to_string()),
            &PipelineEvent::Preview("<p>3</p>".to_string()),
            &PipelineEvent::Done,
        ]
    );
}

#[tokio::test]
async fn malformed_source_stops_before_compile() {
    let (pipeline, backend, _) = pipeline();
    let events = pipeline
        .run(files(&[("Page.zx", "<div malformed"), ("main.zig", "preview3")]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(backend.calls("zx.wasm"), 1);
    assert_eq!(backend.calls("zig.wasm"), 0);
    assert_eq!(backend.calls("main.wasm"), 0);
    assert!(events.contains(&PipelineEvent::Diagnostic(
        "Page.zx:1:5: error: expected '>'".to_string()
    )));
    assert_eq!(
        &events[events.len() - 2..],
        &[
            PipelineEvent::Status(PipelineState::Errored),
            PipelineEvent::Status(PipelineState::Idle),
        ]
    );
    assert!(!events.contains(&PipelineEvent::Done));
}

#[tokio::test]
async fn clean_exit_without_artifact_does_not_run() {
    let (pipeline, backend, _) = pipeline();
    let events = pipeline
        .run(files(&[("main.zig", "no_artifact")]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(backend.calls("main.wasm"), 0);
    assert!(!events
        .iter()
        .any(|event| matches!(event, PipelineEvent::Compiled { .. })));
    assert!(events.iter().any(|event| matches!(
        event,
        PipelineEvent::StepFinished { step: Step::Compile, ok: false, .. }
    )));
    assert_eq!(events.last(), Some(&PipelineEvent::Status(PipelineState::Idle)));
}

#[tokio::test]
async fn compile_errors_are_surfaced_line_by_line() {
    let (pipeline, backend, _) = pipeline();
    let events = pipeline
        .run(files(&[("main.zig", "compile_error")]))
        .unwrap()
        .collect()
        .await;

    let diagnostics: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::Diagnostic(line) => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        diagnostics,
        vec![
            "main.zig:3:9: error: expected ';' after statement",
            "    const x = 1",
            "Compilation failed.",
        ]
    );
    assert_eq!(backend.calls("main.wasm"), 0);
    assert!(events.contains(&PipelineEvent::Status(PipelineState::Errored)));
}

#[tokio::test]
async fn runtime_trap_is_output_not_failure() {
    let (pipeline, _, _) = pipeline();
    let events = pipeline
        .run(files(&[("main.zig", "trap")]))
        .unwrap()
        .collect()
        .await;

    assert!(events.contains(&PipelineEvent::Diagnostic(
        "wasm trap: integer divide by zero".to_string()
    )));
    assert!(!events.contains(&PipelineEvent::Status(PipelineState::Errored)));
    assert_eq!(
        &events[events.len() - 2..],
        &[PipelineEvent::Status(PipelineState::Idle), PipelineEvent::Done]
    );
}

#[tokio::test]
async fn second_run_while_in_flight_is_dropped() {
    let (pipeline, backend, _) = pipeline();
    let project = files(&[("main.zig", "preview3")]);

    let first = pipeline.run(project.clone()).unwrap();
    assert!(pipeline.run(project.clone()).is_none());
    assert!(pipeline.is_running());

    let events = first.collect().await;
    assert_eq!(count(&events, &PipelineEvent::Done), 1);
    assert_eq!(backend.calls("zig.wasm"), 1);
    assert!(!pipeline.is_running());

    // accepted again once the first run settled
    let again = pipeline.run(project).unwrap().collect().await;
    assert_eq!(again.last(), Some(&PipelineEvent::Done));
    assert_eq!(backend.calls("zig.wasm"), 2);
}

#[tokio::test]
async fn transpiles_run_one_after_another_before_compile() {
    let (pipeline, backend, _) = pipeline();
    let events = pipeline
        .run(files(&[
            ("A.zx", "<a/>"),
            ("B.zx", "<b/>"),
            ("main.zig", "preview3"),
        ]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        backend.log(),
        vec![
            "zx.wasm A.zx",
            "zx.wasm A.zx end",
            "zx.wasm B.zx",
            "zx.wasm B.zx end",
            "zig.wasm A.zig,A.zx,B.zig,B.zx,main.zig",
            "main.wasm",
        ]
    );
    assert!(events.contains(&PipelineEvent::Transpiled {
        filename: "A.zig".to_string(),
        content: "pub const markup = \"<a/>\";".to_string(),
    }));
    assert!(events.contains(&PipelineEvent::Status(PipelineState::Transpiling {
        done: 2,
        total: 2
    })));
}

#[tokio::test]
async fn toolchain_archives_are_fetched_once_per_session() {
    let (pipeline, _, source) = pipeline();
    for _ in 0..2 {
        pipeline
            .run(files(&[("main.zig", "preview3")]))
            .unwrap()
            .collect()
            .await;
    }
    // compiler module, library archive, support archive
    assert_eq!(source.fetch_count(), 3);

    let store = ArchiveStore::new(assets(), Arc::new(ArchiveCache::new()));
    let first = store.fetch_root("zig.tar.gz", Some("lib/")).await.unwrap();
    let second = store.fetch_root("zig.tar.gz", Some("lib/")).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.read("std/std.zig").unwrap(), b"pub const std = 1;");
}
