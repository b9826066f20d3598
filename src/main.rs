use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use fleet_ingest::config::{
    FailurePolicy, IngestConfig, LaunchConfig, MonitorConfig, Phase, TransportConfig,
};
use fleet_ingest::coordinator::{Coordinator, RunSummary};
use fleet_ingest::ingest::MpiLauncher;
use fleet_ingest::remote::SshExecutor;
use fleet_ingest::report::render_round;
use fleet_ingest::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleet-ingest")]
#[command(version)]
#[command(about = "Partition a dataset across a worker fleet, fetch it and build shards")]
struct Args {
    /// Number of records to sample from the record list
    n: usize,

    /// Workers per group
    #[arg(short = 'm', default_value_t = 1)]
    group_size: usize,

    /// Give every worker of a group the whole group slice
    #[arg(short = 'r', default_value_t = true, action = ArgAction::Set)]
    replicate: bool,

    /// Resize dimension passed to the loader as width and height
    #[arg(short = 's', default_value_t = 256)]
    resize: u32,

    /// Dataset phase, also the shard subfolder name
    #[arg(long)]
    phase: Phase,

    /// Mean artifact path
    #[arg(long, default_value = "examples/imagenet12/imagenet_mean.binaryproto")]
    mfile: PathBuf,

    /// Candidate record list, one record per line
    #[arg(long, default_value = "examples/imagenet12/validation_label.txt")]
    rfile: PathBuf,

    /// Host list, one worker per line
    #[arg(long, default_value = "examples/imagenet12/hostfile")]
    host: PathBuf,

    /// Absolute shard root on every worker
    #[arg(long, default_value = "/data1/lapis/")]
    local: PathBuf,

    /// Bulk-store directory the fetch script reads from
    #[arg(long, default_value = "imagenet12/validation")]
    hdfs: String,

    // === Supplemented options ===
    /// Fetch script path on the workers [default: download.sh beside this binary]
    #[arg(long)]
    fetch_script: Option<String>,

    /// Shard builder executable, must exist in the working directory
    #[arg(long, default_value = "loader")]
    loader: PathBuf,

    /// Cluster launcher program
    #[arg(long, default_value = "mpirun")]
    launcher: String,

    /// Program used for remote commands
    #[arg(long, default_value = "ssh")]
    ssh: String,

    /// Program used to copy assignment files
    #[arg(long, default_value = "scp")]
    scp: String,

    /// Seconds between two progress rounds
    #[arg(long, default_value_t = 15)]
    interval: u64,

    /// Seconds allowed for one synchronous remote command
    #[arg(long, default_value_t = 60)]
    remote_timeout: u64,

    /// Consecutive failed progress queries before a worker is given up
    #[arg(long, default_value_t = 3)]
    max_poll_failures: u32,

    /// What to do when a worker fails
    #[arg(long, value_enum, default_value = "abort")]
    on_failure: FailurePolicy,

    /// Seed for the record shuffle
    #[arg(long)]
    seed: Option<u64>,

    /// Local directory for staged assignment files [default: per-run temp dir]
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Final report format
    #[arg(long, short = 'o', value_enum, default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl Args {
    fn into_config(self) -> IngestConfig {
        let defaults = IngestConfig::default();
        IngestConfig {
            sample_size: self.n,
            group_size: self.group_size,
            replicate: self.replicate,
            phase: self.phase,
            record_file: self.rfile,
            host_file: self.host,
            local_root: self.local,
            bulk_store: self.hdfs,
            fetch_script: self.fetch_script.unwrap_or_else(default_fetch_script),
            seed: self.seed,
            staging_dir: self.staging_dir.unwrap_or(defaults.staging_dir),
            failure_policy: self.on_failure,
            transport: TransportConfig {
                ssh_program: self.ssh,
                scp_program: self.scp,
                command_timeout: Duration::from_secs(self.remote_timeout),
                ..TransportConfig::default()
            },
            monitor: MonitorConfig {
                poll_interval: Duration::from_secs(self.interval),
                max_poll_failures: self.max_poll_failures,
            },
            launch: LaunchConfig {
                launcher: self.launcher,
                loader: self.loader,
                mean_file: self.mfile,
                resize: self.resize,
            },
        }
    }
}

/// `download.sh` in the directory holding this binary.
fn default_fetch_script() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("download.sh")))
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download.sh".to_string())
}

fn print_summary(summary: &RunSummary, output: &OutputFormat) -> serde_json::Result<()> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Table => {
            print!("{}", summary.report.render_table());
            println!();
            println!("Status: {}", summary.status);
        }
    }
    Ok(())
}

async fn run(args: Args) -> Result<u8, Box<dyn std::error::Error>> {
    let output = args.output.clone();
    let config = args.into_config();
    let cancel = install_shutdown_handler()?;

    let executor = Arc::new(SshExecutor::new(config.transport.clone()));
    let launcher = Arc::new(MpiLauncher::new(&config.launch));
    let coordinator = Coordinator::new(config, executor, launcher);

    let show_rounds = matches!(output, OutputFormat::Table);
    let summary = coordinator
        .run(&cancel, |round| {
            if show_rounds {
                print!("{}", render_round(round));
            }
        })
        .await?;

    print_summary(&summary, &output)?;
    Ok(summary.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so the report on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "Ingestion failed");
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}
