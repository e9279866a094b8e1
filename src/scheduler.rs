//! Background merge and persist loop.
//!
//! The pipeline runs as periodic tasks: a frequent merge promotes
//! committed inter-buffers into the base trees, and a less frequent
//! persist saves roots and chains a metadata chunk. Tasks tick on their
//! own intervals and shut down together on a broadcast signal.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::error::Result;

/// Context provided to background tasks during execution.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
}

/// A task that runs periodically until shutdown.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown.
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Registers the merge and persist tasks for a database.
    pub fn register_pipeline(&self, db: Arc<Database>, config: &crate::config::SchedulerConfig) -> &Self {
        self.register(Arc::new(MergeTask {
            db: db.clone(),
            interval: config.merge_interval,
        }));
        self.register(Arc::new(PersistTask {
            db,
            interval: config.persist_interval,
        }));
        self
    }

    /// Registers a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.write().expect("scheduler lock poisoned").push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                        };
                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown: signal and wait for all tasks.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.write().expect("scheduler lock poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            task.await?;
        }
        Ok(())
    }
}

/// Folds committed inter-buffers into their base trees.
struct MergeTask {
    db: Arc<Database>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for MergeTask {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.merge_step()).await?
    }
}

/// Saves modified roots and chains a metadata chunk.
struct PersistTask {
    db: Arc<Database>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for PersistTask {
    fn name(&self) -> &'static str {
        "persist"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.persist().map(|_| ())).await?
    }
}
