use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use log::{error, info};

use pipekv::{Result, Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "pipekv-server",
    version,
    about = "An in-memory key-value store served over named pipes"
)]
struct Cli {
    /// Directory scanned for .job files
    jobs_dir: PathBuf,

    /// Number of dispatcher worker threads
    max_threads: usize,

    /// Maximum number of concurrent snapshot children
    max_backups: usize,

    /// Rendezvous pipe name; the server listens on /tmp/server_<name>
    pipe_name: String,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    // Argument problems exit 1, like any other fatal init failure.
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        exit(1);
    });

    if let Err(e) = run(cli) {
        error!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("pipekv-server {}", env!("CARGO_PKG_VERSION"));
    info!("jobs directory: {}", cli.jobs_dir.display());

    let server = Server::bind(ServerConfig {
        jobs_dir: cli.jobs_dir,
        max_threads: cli.max_threads,
        max_backups: cli.max_backups,
        pipe_name: cli.pipe_name,
    })?;
    server.run()
}
