use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use unshd::{Config, Dispatcher};

/// Remote pipeline daemon: each line a client sends is run as a pipeline
/// and its output is streamed back.
#[derive(Parser, Debug)]
#[command(name = "unshd", version)]
struct Args {
    /// JSON config file; flags below override its values.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// TCP port; 0 picks a free one.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let mut daemon = Dispatcher::bind(config).context("startup failed")?;
    // the bound address is the one line unshd writes to stdout
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "listening {}", daemon.local_addr())?;
    stdout.flush()?;
    drop(stdout);

    daemon.run()?;
    Ok(())
}
