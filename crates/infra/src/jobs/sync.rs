//! Bounded worker pool recording a user's last access at their IdP identity.
//!
//! Enqueueing never blocks: a full queue drops the task with a warning.
//! Task failures are retried per [`RetryPolicy`], logged and counted, and
//! never reach the request that produced the task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use memberguard_auth::OracleError;
use memberguard_core::{UserExtSource, UserId};

use super::retry::RetryPolicy;
use crate::config::SyncConfig;

/// Write side of the membership directory used by background sync.
#[async_trait]
pub trait DirectorySink: Send + Sync {
    /// Find the identity a user has at `ext_source_name` under `login`.
    async fn find_user_ext_source(
        &self,
        ext_source_name: &str,
        login: &str,
    ) -> Result<Option<UserExtSource>, OracleError>;

    async fn update_user_ext_source_last_access(&self, ues: &UserExtSource) -> Result<(), OracleError>;
}

#[async_trait]
impl<S> DirectorySink for Arc<S>
where
    S: DirectorySink + ?Sized,
{
    async fn find_user_ext_source(
        &self,
        ext_source_name: &str,
        login: &str,
    ) -> Result<Option<UserExtSource>, OracleError> {
        (**self).find_user_ext_source(ext_source_name, login).await
    }

    async fn update_user_ext_source_last_access(&self, ues: &UserExtSource) -> Result<(), OracleError> {
        (**self).update_user_ext_source_last_access(ues).await
    }
}

/// "User `user_id` just logged in through `ext_source_name` as one of `logins`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub user_id: UserId,
    pub ext_source_name: String,
    /// Candidate logins, tried in order.
    pub logins: Vec<String>,
}

impl SyncTask {
    /// Build a task from IdP attributes, taking logins from `identifier_attributes` in order.
    ///
    /// `None` when there is no issuer or no identifier value to match on.
    pub fn from_attributes(
        user_id: UserId,
        issuer: Option<&str>,
        attributes: &BTreeMap<String, Vec<String>>,
        identifier_attributes: &[String],
    ) -> Option<Self> {
        let ext_source_name = issuer.map(str::trim).filter(|i| !i.is_empty())?;
        let logins: Vec<String> = identifier_attributes
            .iter()
            .filter_map(|name| attributes.get(name))
            .flatten()
            .filter(|v| !v.is_empty())
            .cloned()
            .collect();
        if logins.is_empty() {
            return None;
        }
        Some(Self {
            user_id,
            ext_source_name: ext_source_name.to_string(),
            logins,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    pub name: String,
    pub workers: usize,
    pub capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            name: "directory-sync".to_string(),
            workers: 2,
            capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&SyncConfig> for SyncQueueConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            capacity: config.queue_capacity.max(1),
            retry: config.retry_policy(),
            ..Default::default()
        }
    }
}

/// Queue runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SyncStats {
        SyncStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running worker pool.
pub struct SyncQueue {
    name: String,
    tx: mpsc::Sender<SyncTask>,
    counters: Arc<Counters>,
    workers: Vec<JoinHandle<()>>,
}

impl SyncQueue {
    /// Spawn the workers on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn DirectorySink>, config: SyncQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers.max(1))
            .map(|index| {
                let worker = Worker {
                    name: format!("{}-{}", config.name, index),
                    sink: sink.clone(),
                    retry: config.retry,
                    counters: counters.clone(),
                };
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();

        info!(queue = %config.name, workers = config.workers, capacity = config.capacity, "sync queue started");
        Self {
            name: config.name,
            tx,
            counters,
            workers,
        }
    }

    /// Hand a task to the pool. Returns `false` if it was dropped.
    pub fn enqueue(&self, task: SyncTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %self.name, user_id = %task.user_id, "sync queue full; dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %self.name, user_id = %task.user_id, "sync queue closed; dropping task");
                false
            }
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.counters.snapshot()
    }

    /// Stop accepting tasks and wait for queued ones to finish.
    pub async fn shutdown(self) -> SyncStats {
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(queue = %self.name, error = %e, "sync worker ended abnormally");
            }
        }
        info!(queue = %self.name, "sync queue stopped");
        self.counters.snapshot()
    }
}

struct Worker {
    name: String,
    sink: Arc<dyn DirectorySink>,
    retry: RetryPolicy,
    counters: Arc<Counters>,
}

/// Why one execution of a task did not succeed.
enum TaskFailure {
    /// Worth another attempt (directory unavailable).
    Transient(OracleError),
    /// Will not get better by retrying.
    Permanent(String),
}

impl Worker {
    async fn run(self, rx: Arc<Mutex<mpsc::Receiver<SyncTask>>>) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(task) = next else { break };
            self.process(task).await;
        }
        debug!(worker = %self.name, "sync worker exiting");
    }

    async fn process(&self, task: SyncTask) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute(&task).await {
                Ok(ues) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        worker = %self.name,
                        user_id = %task.user_id,
                        ues_id = %ues.id,
                        attempt,
                        "updated user ext source last access"
                    );
                    return;
                }
                Err(TaskFailure::Transient(e)) if self.retry.allows_another(attempt) => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.backoff(attempt);
                    debug!(worker = %self.name, user_id = %task.user_id, attempt, error = %e, ?delay, "retrying sync task");
                    tokio::time::sleep(delay).await;
                }
                Err(TaskFailure::Transient(e)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = %self.name, user_id = %task.user_id, attempt, error = %e, "sync task failed after retries");
                    return;
                }
                Err(TaskFailure::Permanent(reason)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = %self.name, user_id = %task.user_id, reason = %reason, "sync task failed");
                    return;
                }
            }
        }
    }

    async fn execute(&self, task: &SyncTask) -> Result<UserExtSource, TaskFailure> {
        for login in &task.logins {
            let found = self
                .sink
                .find_user_ext_source(&task.ext_source_name, login)
                .await
                .map_err(classify)?;
            if let Some(ues) = found {
                self.sink
                    .update_user_ext_source_last_access(&ues)
                    .await
                    .map_err(classify)?;
                return Ok(ues);
            }
        }
        Err(TaskFailure::Permanent(format!(
            "no user ext source for user {} at '{}'",
            task.user_id, task.ext_source_name
        )))
    }
}

fn classify(e: OracleError) -> TaskFailure {
    match e {
        OracleError::Unavailable(_) => TaskFailure::Transient(e),
        other => TaskFailure::Permanent(other.to_string()),
    }
}
