//! git-lfs-transfer - Git LFS pure-SSH transfer agent
//!
//! Invoked by sshd as `git-lfs-transfer <repo> <upload|download>`. Speaks
//! pkt-line on stdin/stdout and keeps objects and locks under the
//! repository's LFS directory.

use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lfs_core::{LfsLayout, LockRegistry, ObjectStore, Operation, OsIdentity, TransferConfig};
use lfs_protocol::{CommandHandler, SessionEngine};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "git-lfs-transfer")]
#[command(author = "git-lfs-transfer Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Serve Git LFS objects and locks over SSH", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Repository path, as passed by the SSH client
    git_dir: String,

    /// Transfer direction: upload or download
    operation: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.debug { "debug" } else { "warn" })
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let operation: Operation = cli
        .operation
        .parse()
        .with_context(|| format!("invalid operation {:?}", cli.operation))?;

    let lfs_dir = lfs_core::resolve_lfs_dir(&cli.git_dir);
    let layout = LfsLayout::new(&lfs_dir);
    layout
        .bootstrap()
        .with_context(|| format!("failed to prepare {}", lfs_dir.display()))?;
    let config = TransferConfig::load(layout.root())
        .with_context(|| format!("failed to load configuration from {}", lfs_dir.display()))?;
    debug!("Configuration: {:?}", config);

    info!("Starting {} session for {}", operation, lfs_dir.display());

    let store = ObjectStore::new(layout.clone(), &config);
    let locks = LockRegistry::new(layout, &config, Arc::new(OsIdentity));

    // The session is a blocking read/reply loop over stdio
    tokio::task::spawn_blocking(move || {
        let input = BufReader::new(std::io::stdin().lock());
        let output = BufWriter::new(std::io::stdout().lock());
        let handler = CommandHandler::new(output, store, locks, operation);
        SessionEngine::new(input, handler).run()
    })
    .await
    .context("session task failed")?
    .context("transfer session failed")?;

    info!("Session complete");
    Ok(())
}
