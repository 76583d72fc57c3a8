use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "airgap-deploy")]
#[command(about = "Offline Confluence deployment - image transfer and service lifecycle")]
#[command(version)]
struct Cli {
    /// Configuration file path (default: ./deploy.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull images and save them as archives (networked host)
    Download {
        /// Images to archive instead of the configured set
        #[arg(long, value_delimiter = ',')]
        images: Vec<String>,

        /// Archive the images referenced by a compose file
        #[arg(long, conflicts_with = "images")]
        compose_file: Option<PathBuf>,

        /// Directory receiving the archives
        #[arg(short, long, default_value = "offline_images")]
        output: PathBuf,

        /// Concurrent pull/save workers
        #[arg(short, long, default_value_t = 3)]
        workers: usize,

        /// Do not write images_manifest.json
        #[arg(long)]
        no_manifest: bool,
    },

    /// Load image archives into the container runtime (air-gapped host)
    Import {
        /// Directory holding the archives
        #[arg(default_value = "offline_images")]
        dir: PathBuf,

        /// Load these archives instead of scanning the directory
        #[arg(long, num_args = 1..)]
        files: Vec<PathBuf>,

        /// Skip the manifest consistency check
        #[arg(long)]
        no_verify: bool,

        /// Load archives even when their image is already present
        #[arg(long)]
        force: bool,

        /// Remove dangling images afterwards
        #[arg(long)]
        cleanup: bool,

        /// Show the images already loaded instead of importing
        #[arg(short, long, conflicts_with_all = ["files", "force", "cleanup", "no_verify"])]
        list: bool,
    },

    /// Create the directory layout and the env override file
    Configure {
        /// Database backend (mysql or postgresql)
        backend: Option<String>,
    },

    /// Bring the workload up and wait until it is ready
    Start {
        /// Database backend (mysql or postgresql)
        backend: Option<String>,

        /// Return as soon as the containers are up
        #[arg(long)]
        no_wait: bool,
    },

    /// Bring the workload down
    Stop {
        /// Database backend (mysql or postgresql)
        backend: Option<String>,

        /// Remove the containers instead of only stopping them
        #[arg(long)]
        remove: bool,

        /// Remove dangling images afterwards
        #[arg(long)]
        cleanup: bool,

        /// Remove named volumes too (deletes all data)
        #[arg(long)]
        volumes: bool,

        /// Confirm volume removal without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Register the workload with the service manager and enable it at boot
    Install,

    /// Show images, containers, service unit and readiness
    Status,

    /// Print the tail of a workload container's log or the service journal
    Logs {
        /// What to read
        #[arg(value_enum)]
        service: LogTarget,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 100)]
        tail: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogTarget {
    /// Application container
    App,
    /// Database container
    Database,
    /// Service manager journal of the unit
    Service,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let ctx = commands::Context {
        config: cli.config,
        json: cli.json,
    };

    let code = smol::block_on(async {
        match cli.command {
            Commands::Download {
                images,
                compose_file,
                output,
                workers,
                no_manifest,
            } => {
                let args = commands::download::Args {
                    images,
                    compose_file,
                    output,
                    workers,
                    write_manifest: !no_manifest,
                };
                commands::download::run(&ctx, args).await
            }
            Commands::Import {
                dir,
                files,
                no_verify,
                force,
                cleanup,
                list,
            } => {
                let args = commands::import::Args {
                    dir,
                    files,
                    verify: !no_verify,
                    force,
                    cleanup,
                    list,
                };
                commands::import::run(&ctx, args).await
            }
            Commands::Configure { backend } => commands::configure::run(&ctx, backend).await,
            Commands::Start { backend, no_wait } => {
                commands::start::run(&ctx, backend, !no_wait).await
            }
            Commands::Stop {
                backend,
                remove,
                cleanup,
                volumes,
                yes,
            } => {
                let args = commands::stop::Args {
                    backend,
                    remove,
                    cleanup,
                    volumes,
                    yes,
                };
                commands::stop::run(&ctx, args).await
            }
            Commands::Install => commands::install::run(&ctx).await,
            Commands::Status => commands::status::run(&ctx).await,
            Commands::Logs { service, tail } => commands::logs::run(&ctx, service, tail).await,
        }
    })?;

    Ok(ExitCode::from(code))
}
