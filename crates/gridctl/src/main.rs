//! gridctl — bring a fixed-topology cluster up, down, and to scale.
//!
//! # Usage
//!
//! ```text
//! gridctl init --name spark --image bitnami/spark:3.5
//! gridctl up --supervise
//! gridctl scale 4
//! gridctl status --format json
//! gridctl down --purge
//! ```
//!
//! Nothing is persisted between runs beyond the containers themselves;
//! every command rebuilds node state from the container runtime.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod bootstrap;
mod commands;

#[derive(Parser)]
#[command(
    name = "gridctl",
    about = "nodegrid — fixed-topology cluster bootstrap and convergence",
    version,
    propagate_version = true
)]
struct Cli {
    /// Topology document.
    #[arg(short, long, global = true, default_value = "nodegrid.toml")]
    file: PathBuf,

    /// Docker binary to drive.
    #[arg(long, global = true, default_value = "docker")]
    docker: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter topology document with one coordinator and two
    /// workers.
    Init {
        /// Cluster name.
        #[arg(long, default_value = "spark")]
        name: String,
        /// Image every node runs.
        #[arg(long, default_value = "bitnami/spark:3.5")]
        image: String,
        /// Overwrite an existing document.
        #[arg(long)]
        force: bool,
    },
    /// Create the fabric and start every node, coordinator first.
    ///
    /// Exits 0 once every node is running, non-zero if the cluster does
    /// not converge within the lifecycle's up_timeout.
    Up {
        /// Keep health checks and the convergence loop running until
        /// Ctrl-C.
        #[arg(long)]
        supervise: bool,
    },
    /// Stop and remove every node, then the fabric.
    Down {
        /// Also remove node volumes.
        #[arg(long)]
        purge: bool,
    },
    /// Print every node's status and endpoints.
    Status {
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Set the desired worker count, save it to the topology document,
    /// and reconcile.
    Scale {
        /// Desired number of workers.
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,gridctl=debug,nodegrid=debug".into());
    let logs = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        logs.json().init();
    } else {
        logs.init();
    }

    match cli.command {
        Commands::Init { name, image, force } => commands::init::init(&cli.file, &name, &image, force),
        Commands::Up { supervise } => commands::up::up(&cli.file, &cli.docker, supervise).await,
        Commands::Down { purge } => commands::down::down(&cli.file, &cli.docker, purge).await,
        Commands::Status { format } => commands::status::status(&cli.file, &cli.docker, &format).await,
        Commands::Scale { count } => commands::scale::scale(&cli.file, &cli.docker, count).await,
    }
}
