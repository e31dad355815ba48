use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zx_playground::{
    FileSet, Pipeline, PipelineEvent, PipelineState, PlaygroundConfig, Stages, Toolchain,
};

/// ZX Playground - transpile, compile and run ZX/Zig projects in a sandbox
///
/// The transpiler, the compiler and the compiled program all run as
/// WebAssembly modules with access only to in-memory mounts.
#[derive(Parser)]
#[command(name = "zx-playground")]
#[command(version = "0.1.0")]
#[command(about = "Sandboxed ZX/Zig playground pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Asset base: a directory or an http(s) URL
    #[arg(long)]
    assets: Option<String>,

    /// Persistent download cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transpile, compile and run a project directory
    Run {
        /// Project directory
        dir: PathBuf,
    },
    /// Transpile a single .zx file and print the result
    Transpile {
        /// The file to transpile
        file: PathBuf,
    },
    /// Download and decode every toolchain asset
    Warm,
    /// List the files of a toolchain archive
    Inspect {
        /// Archive path relative to the asset base
        archive: String,
        /// Only include entries under this prefix, stripped
        #[arg(long)]
        prefix: Option<String>,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for program output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };

    let result = match &cli.command {
        Commands::Run { dir } => run_project(&config, dir, cli.json).await,
        Commands::Transpile { file } => transpile_file(&config, file).await,
        Commands::Warm => warm(&config, cli.json).await,
        Commands::Inspect { archive, prefix } => {
            inspect(&config, archive, prefix.as_deref(), cli.json).await
        }
    };

    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<PlaygroundConfig, Box<dyn std::error::Error>> {
    let mut config = PlaygroundConfig::load(cli.config.as_deref())?;
    if let Some(assets) = &cli.assets {
        config.assets.base = assets.clone();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache.dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run_project(config: &PlaygroundConfig, dir: &Path, json: bool) -> CliResult {
    let mut files = FileSet::from_dir(dir)?;
    info!("Running {} ({} files)", dir.display(), files.len());

    let pipeline = Pipeline::from_config(config)?;
    let mut run = pipeline
        .run(files.snapshot())
        .ok_or("a run is already in flight")?;

    let mut errored = false;
    let mut stdout = std::io::stdout();
    while let Some(event) = run.events.recv().await {
        if json {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
            continue;
        }
        match event {
            PipelineEvent::Status(PipelineState::Errored) => errored = true,
            PipelineEvent::Transpiled { filename, content } => {
                files.mirror_transpiled(filename, content);
            }
            PipelineEvent::Diagnostic(line) => eprintln!("{line}"),
            PipelineEvent::Log(line) => eprintln!("{line}"),
            PipelineEvent::Preview(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            PipelineEvent::Compiled { bytes } => info!("Compiled {} bytes", bytes),
            _ => {}
        }
    }

    if errored {
        return Err("build failed".into());
    }
    Ok(())
}

async fn transpile_file(config: &PlaygroundConfig, file: &Path) -> CliResult {
    let content = std::fs::read_to_string(file)?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or("not a file path")?;

    let stages = Stages::from_config(config)?;
    let out = stages.transpile.transpile(&filename, &content).await?;
    print!("{}", out.content);
    Ok(())
}

async fn warm(config: &PlaygroundConfig, json: bool) -> CliResult {
    let report = Toolchain::from_config(config).warm().await?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }
    println!("\n{}", "=".repeat(60));
    println!("Toolchain Assets");
    println!("{}", "=".repeat(60));
    println!("Compiler: {} bytes", report.compiler_bytes);
    println!("Transpiler: {} bytes", report.transpiler_bytes);
    println!("Library Files: {}", report.library_files);
    println!("Support Files: {}", report.support_files);
    println!("{}", "=".repeat(60));
    Ok(())
}

async fn inspect(config: &PlaygroundConfig, archive: &str, prefix: Option<&str>, json: bool) -> CliResult {
    let toolchain = Toolchain::from_config(config);
    let root = toolchain.archives().fetch_root(archive, prefix).await?;
    let paths = root.file_paths();

    if json {
        println!("{}", serde_json::to_string(&paths)?);
        return Ok(());
    }
    println!("\n{}", "=".repeat(60));
    println!("{} ({} files)", archive, paths.len());
    println!("{}", "=".repeat(60));
    for path in &paths {
        let size = root.read(path).map(<[u8]>::len).unwrap_or(0);
        println!("{:>10}  {}", size, path);
    }
    println!("{}", "=".repeat(60));
    Ok(())
}
