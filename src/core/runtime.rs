use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::clock::{Clock, SystemClock};
use crate::core::harvester::{HarvestOptions, HarvestReport, Harvester};
use crate::core::snapshotter::Snapshotter;
use crate::core::stream::StreamClassifier;
use crate::core::updater::MetricUpdater;
use crate::export::export_timelines;
use crate::providers::{SocialApi, TwitterClient};
use crate::roster::Roster;
use crate::storage::{DocumentStore, SqliteStore};

/// Long-running workers that can share one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    Followers,
    Stream,
    Updater,
}

impl Worker {
    pub const ALL: [Worker; 3] = [Worker::Followers, Worker::Stream, Worker::Updater];
}

/// Owns the shared collaborators and starts workers on top of them.
pub struct Runtime {
    roster: Arc<Roster>,
    api: Arc<dyn SocialApi>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    queue_path: Option<PathBuf>,
    updater_idle: Option<Duration>,
    cancel: CancellationToken,
}

impl Runtime {
    pub fn new(
        roster: Roster,
        api: Arc<dyn SocialApi>,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Runtime {
            roster: Arc::new(roster),
            api,
            store,
            clock,
            queue_path: None,
            updater_idle: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire up the real API client, SQLite store and roster.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let roster = Roster::load(&config.roster_path)?;
        let api = TwitterClient::with_endpoints(
            config.credentials.clone(),
            &config.api_base,
            &config.stream_base,
        );
        let db_path = config.database_path();
        let store = SqliteStore::open(&db_path)
            .await
            .with_context(|| format!("Failed to open storage at {}", db_path.display()))?;
        info!(db = %store.path().display(), accounts = roster.len(), "Runtime ready");

        Ok(Runtime::new(roster, Arc::new(api), Arc::new(store), Arc::new(SystemClock))
            .with_queue_path(config.queue_path())
            .with_updater_idle(config.updater_idle))
    }

    pub fn with_queue_path(mut self, path: PathBuf) -> Self {
        self.queue_path = Some(path);
        self
    }

    pub fn with_updater_idle(mut self, idle: Duration) -> Self {
        self.updater_idle = Some(idle);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every worker on the first Ctrl-C.
    pub fn shutdown_on_ctrl_c(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "Could not listen for Ctrl-C"),
            }
        });
    }

    pub async fn harvest(&self, options: &HarvestOptions) -> HarvestReport {
        Harvester::new(Arc::clone(&self.api), Arc::clone(&self.store))
            .run(&self.roster, options, &self.cancel)
            .await
    }

    /// Run the given workers side by side until cancelled.
    pub async fn run_workers(&self, workers: &[Worker]) -> Result<()> {
        if self.roster.is_empty() {
            warn!("Roster is empty, workers will have nothing to do");
        }
        info!(?workers, accounts = self.roster.len(), "Starting workers");
        let mut tasks = JoinSet::new();

        for &worker in workers {
            let roster = Arc::clone(&self.roster);
            let cancel = self.cancel.clone();
            match worker {
                Worker::Followers => {
                    let mut snapshotter = Snapshotter::new(
                        Arc::clone(&self.api),
                        Arc::clone(&self.store),
                        Arc::clone(&self.clock),
                    );
                    if let Some(path) = &self.queue_path {
                        snapshotter = snapshotter.with_queue_path(path.clone());
                    }
                    tasks.spawn(async move {
                        snapshotter.run(&roster, &cancel).await;
                        worker
                    });
                }
                Worker::Stream => {
                    let classifier = StreamClassifier::new(
                        Arc::clone(&self.api),
                        Arc::clone(&self.store),
                        Arc::clone(&self.clock),
                    );
                    tasks.spawn(async move {
                        classifier.run(roster, &cancel).await;
                        worker
                    });
                }
                Worker::Updater => {
                    let mut updater = MetricUpdater::new(
                        Arc::clone(&self.api),
                        Arc::clone(&self.store),
                        Arc::clone(&self.clock),
                    );
                    if let Some(idle) = self.updater_idle {
                        updater = updater.with_idle(idle);
                    }
                    tasks.spawn(async move {
                        updater.run(&cancel).await;
                        worker
                    });
                }
            }
        }

        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(worker) => info!(?worker, "Worker finished"),
                Err(e) => {
                    error!(error = %e, "Worker task failed, stopping the rest");
                    failed += 1;
                    self.cancel.cancel();
                }
            }
        }
        if failed > 0 {
            bail!("{} worker(s) failed", failed);
        }
        Ok(())
    }

    pub async fn export(&self, output: &Path) -> Result<usize> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(output).with_context(|| format!("Cannot create {}", output.display()))?;
        export_timelines(self.store.as_ref(), BufWriter::new(file)).await
    }
}
