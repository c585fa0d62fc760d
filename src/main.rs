//! `txrelayd` process entry point: CLI parsing, config load, master spawn.

use std::path::PathBuf;

use clap::Parser;

/// Multi-process HTTP/1.1 and HTTP/2 front-end terminating TLS and
/// broadcasting transactions to a Bitcoin JSON-RPC node.
#[derive(Parser, Debug)]
#[command(name = "txrelayd", version)]
struct Cli {
    /// Parse the config, print it, and exit without starting any workers.
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Override the worker count (defaults to CPU count, clamped to 1..=64).
    #[arg(short = 'w', long = "workers")]
    workers: Option<u32>,

    /// Path to the INI-style config file.
    #[arg(default_value = "txrelayd.conf")]
    config_path: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match txrelayd::config::Config::load(&cli.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", cli.config_path.display());
            std::process::exit(1);
        }
    };
    if let Some(w) = cli.workers {
        config.server.0.workers = Some(w);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .init();

    if cli.test {
        println!("{config:#?}");
        std::process::exit(0);
    }

    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install default TLS crypto provider: {e:?}");
        std::process::exit(1);
    }

    let worker_count = txrelayd::master::resolve_worker_count(config.server.workers);
    let total_slot_max = config.slots.normal + config.slots.large + config.slots.huge;
    if let Err(e) = txrelayd::master::ensure_fd_limit(worker_count, total_slot_max) {
        eprintln!("fd limit check failed: {e}");
        std::process::exit(1);
    }

    let mut master = txrelayd::master::Master::new(config, cli.config_path);
    master.install_signal_handlers();
    master.spawn_initial_workers(worker_count);
    master.run_loop();
}
