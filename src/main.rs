// src/main.rs

use anyhow::{bail, Context, Result};
use bookdl::prelude::*;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Download books from mirror links, one at a time.
#[derive(Debug, Parser)]
#[command(name = "bookdl", version)]
struct Cli {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory to store books in; overrides the config file.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Bandwidth cap in bytes per second; overrides the config file.
    #[arg(long)]
    rate_limit: Option<u64>,

    /// Direct file links to download.
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ManagerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(dir) = cli.dir {
        config.download_dir = dir;
    }
    if let Some(rate) = cli.rate_limit {
        config.rate_limit = rate;
    }

    let manager = DownloadManager::from_config(config).await?;
    let mut events = manager.subscribe();
    manager.start();

    let mut ids = Vec::new();
    for url in &cli.urls {
        let title = url
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or(url.as_str())
            .to_string();
        let book = BookItem::new(url.clone(), title);
        ids.push(manager.download_url(url.clone(), book).id());
    }
    if ids.is_empty() {
        bail!("nothing to download, pass at least one URL");
    }

    loop {
        let finished = ids
            .iter()
            .all(|id| manager.get(*id).map_or(true, |t| t.state().is_terminal()));
        if finished {
            break;
        }
        match events.recv().await {
            Ok(TaskEvent::StateChanged(id, state)) => {
                if let Some(task) = manager.get(id) {
                    info!(task = %id, mirror = %task.url().map(mirror_label).unwrap_or_default(), ?state, "state changed");
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!(missed, "missed progress events"),
            Err(RecvError::Closed) => break,
        }
    }

    let failed: Vec<_> = manager
        .snapshots()
        .into_iter()
        .filter(|s| ids.contains(&s.id) && matches!(s.state, TaskState::Failed(_)))
        .collect();
    manager.shutdown().await;
    for snapshot in &failed {
        warn!(task = %snapshot.id, url = snapshot.url.as_deref().unwrap_or("-"), state = ?snapshot.state, "download failed");
    }
    if !failed.is_empty() {
        bail!("{} of {} downloads failed", failed.len(), ids.len());
    }
    Ok(())
}
