use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config_loader::{ConfigManager, DeploymentConfig};
use orchestrator::{
    JobStatus, ListCablesRequest, Orchestrator, ProgramRequest, Request, SynthesizeRequest,
    Upload, UploadSpool,
};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "synthctl", version, about = "Run Quartus synthesis and programming jobs")]
struct Cli {
    /// JSON deployment configuration (defaults to $SYNTH_CONFIG)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List programming cables attached to this host
    ListCables {
        /// Use the 64-bit toolchain binaries
        #[arg(long)]
        use64bit: bool,
    },
    /// Download a bitstream to an attached device
    Program {
        /// Bitstream to program (.sof or .pof)
        #[arg(long, value_name = "PATH")]
        bitfile: PathBuf,
        /// Cable name as reported by list-cables
        #[arg(long)]
        cable: String,
        /// Programming mode: "jtag" or "as"
        #[arg(long)]
        mode: String,
        #[arg(long)]
        use64bit: bool,
    },
    /// Synthesize a zipped project and publish the bitstream archive
    Synthesize {
        /// Project archive containing sandbox/ and scripts/
        #[arg(long, value_name = "PATH")]
        zipfile: PathBuf,
        /// Also convert to a flash image for this device
        #[arg(long)]
        flashname: Option<String>,
        #[arg(long)]
        use64bit: bool,
    },
    /// Print the effective configuration as JSON
    Config,
    /// Print version and exit
    Version,
}

// stdout carries the job response, so diagnostics go to stderr.
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn load_config(path: Option<PathBuf>) -> Result<DeploymentConfig> {
    let manager = match path {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new(),
    };
    let config = manager.load().context("failed to load deployment configuration")?;
    Ok(config)
}

fn receive(spool: &UploadSpool, path: &Path) -> Result<Upload> {
    let declared = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    spool
        .receive(path, &declared)
        .with_context(|| format!("failed to receive {}", path.display()))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let request = match cli.cmd {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Commands::Config => {
            let config = load_config(cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        other => other,
    };

    let config = load_config(cli.config)?;
    let spool = UploadSpool::new(&config.upload_dir)?;
    let request = match request {
        Commands::ListCables { use64bit } => Request::ListCables(ListCablesRequest {
            use_64bit: use64bit,
        }),
        Commands::Program {
            bitfile,
            cable,
            mode,
            use64bit,
        } => Request::Program(ProgramRequest {
            bitfile: receive(&spool, &bitfile)?,
            cable,
            mode,
            use_64bit: use64bit,
        }),
        Commands::Synthesize {
            zipfile,
            flashname,
            use64bit,
        } => Request::Synthesize(SynthesizeRequest {
            zipfile: receive(&spool, &zipfile)?,
            flash_name: flashname,
            use_64bit: use64bit,
        }),
        Commands::Config | Commands::Version => return Ok(()),
    };

    let orchestrator = Orchestrator::new(config);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let job = orchestrator.handle(request, &mut out);
    drop(out);

    if job.status() != JobStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
