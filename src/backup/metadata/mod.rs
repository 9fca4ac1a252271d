pub mod mysql;

use crate::backup::cancel::{CancelToken, POLL_INTERVAL};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZero;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[display("size")]
    Size,
    #[display("tables")]
    Tables,
    #[display("procedures")]
    Procedures,
    #[display("functions")]
    Functions,
    #[display("views")]
    Views,
    #[display("grants")]
    Grants,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Size,
        Metric::Tables,
        Metric::Procedures,
        Metric::Functions,
        Metric::Views,
        Metric::Grants,
    ];

    /// Critical metrics surface their failure on the record.
    pub fn is_critical(self) -> bool {
        matches!(self, Metric::Size | Metric::Tables)
    }
}

/// Read-only access to the statistics of a database server.
pub trait MetadataSource: Send + Sync {
    fn list_databases(&self) -> Result<Vec<String>>;

    /// Runs one metric query; implementations must give up after `timeout`.
    fn query_metric(&self, database: &str, metric: Metric, timeout: Duration) -> Result<u64>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder, Getters, CopyGetters)]
pub struct DatabaseMetadata {
    #[getset(get = "pub")]
    #[builder(into)]
    name: String,
    #[getset(get_copy = "pub")]
    #[builder(default)]
    size_bytes: u64,
    #[getset(get_copy = "pub")]
    #[builder(default)]
    table_count: u64,
    #[getset(get_copy = "pub")]
    #[builder(default)]
    procedure_count: u64,
    #[getset(get_copy = "pub")]
    #[builder(default)]
    function_count: u64,
    #[getset(get_copy = "pub")]
    #[builder(default)]
    view_count: u64,
    #[getset(get_copy = "pub")]
    #[builder(default)]
    user_grant_count: u64,
    #[getset(get_copy = "pub")]
    #[builder(default = Utc::now())]
    collected_at: DateTime<Utc>,
    #[getset(get = "pub")]
    #[builder(into)]
    error: Option<String>,
}

impl DatabaseMetadata {
    fn failed(name: &str, reason: &str) -> Self {
        Self::builder().name(name).error(reason.to_string()).build()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

/// Counters shared by all collector workers.
#[derive(Debug, Default)]
pub struct CollectionProgress {
    total: AtomicUsize,
    started: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl CollectionProgress {
    fn reset(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.started.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
    }

    fn record_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn record_finish(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Runs one job per database on a bounded rayon pool. Each job fans out into
/// one thread per metric under a job-level deadline. Size and table count are
/// critical; the other metrics fall back to zero.
#[derive(Builder)]
pub struct MetadataCollector {
    source: Arc<dyn MetadataSource>,
    /// Upper bound on concurrent jobs; defaults to the available parallelism
    workers: Option<usize>,
    #[builder(default = DEFAULT_QUERY_TIMEOUT)]
    query_timeout: Duration,
    #[builder(default = DEFAULT_JOB_TIMEOUT)]
    job_timeout: Duration,
    #[builder(default)]
    progress: Arc<CollectionProgress>,
}

impl MetadataCollector {
    pub fn progress(&self) -> Arc<CollectionProgress> {
        Arc::clone(&self.progress)
    }

    fn worker_count(&self, jobs: usize) -> usize {
        self.workers
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(NonZero::get)
                    .unwrap_or(1)
            })
            .min(jobs)
            .max(1)
    }

    /// Collects one record per name. Never fails as a whole; problems are
    /// recorded on the affected database's record.
    pub fn collect(&self, cancel: &CancelToken, names: &[String]) -> HashMap<String, DatabaseMetadata> {
        let total = names.len();
        self.progress.reset(total);
        if total == 0 {
            return HashMap::new();
        }

        let workers = self.worker_count(total);
        info!("Collecting metadata for {} databases with {} workers", total, workers);

        let mut results = HashMap::with_capacity(total);
        match ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("metadata-worker-{i}"))
            .build()
        {
            Ok(pool) => {
                let (result_tx, result_rx) = mpsc::channel::<DatabaseMetadata>();
                pool.install(|| {
                    names.par_iter().for_each_with(result_tx, |result_tx, name| {
                        self.progress.record_start();
                        let record = self.collect_one(cancel, name);
                        self.progress.record_finish(record.error.is_some());
                        // The receiver outlives the pool.
                        let _ = result_tx.send(record);
                    })
                });

                // Drain exactly one result per job; a disconnect means every worker is gone.
                for _ in 0..total {
                    match result_rx.recv() {
                        Ok(record) => {
                            results.insert(record.name.clone(), record);
                        }
                        Err(_) => break,
                    }
                }
            }
            Err(e) => warn!("Cannot start metadata worker pool: {}", Error::from(e)),
        }

        for name in names {
            if !results.contains_key(name) {
                self.progress.record_finish(true);
                results.insert(
                    name.clone(),
                    DatabaseMetadata::failed(name, "metadata collection did not run"),
                );
            }
        }

        let progress = self.progress.snapshot();
        info!(
            "Metadata collection finished: {}/{} complete, {} with errors",
            progress.completed, progress.total, progress.failed
        );
        results
    }

    fn collect_one(&self, cancel: &CancelToken, name: &str) -> DatabaseMetadata {
        if cancel.is_cancelled() {
            return DatabaseMetadata::failed(name, &Error::Cancelled.to_string());
        }

        let (tx, rx) = mpsc::channel();
        let mut outcomes: HashMap<Metric, Result<u64>> = HashMap::new();
        for metric in Metric::ALL {
            let tx = tx.clone();
            let source = Arc::clone(&self.source);
            let database = name.to_string();
            let timeout = self.query_timeout;
            let spawned = thread::Builder::new()
                .name(format!("metadata-{metric}"))
                .spawn(move || {
                    let outcome = source.query_metric(&database, metric, timeout);
                    // The job may have given up on this metric already.
                    let _ = tx.send((metric, outcome));
                });
            if let Err(e) = spawned {
                outcomes.insert(metric, Err(e.into()));
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.job_timeout;
        while outcomes.len() < Metric::ALL.len() && !cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok((metric, outcome)) => {
                    outcomes.insert(metric, outcome);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let missing = if cancel.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Timeout(self.job_timeout)
        }
        .to_string();

        let mut errors = Vec::new();
        let mut value = |metric: Metric| match outcomes.remove(&metric) {
            Some(Ok(v)) => v,
            Some(Err(e)) => {
                degrade(name, metric, &e.to_string(), &mut errors);
                0
            }
            None => {
                degrade(name, metric, &missing, &mut errors);
                0
            }
        };

        let record = DatabaseMetadata::builder()
            .name(name)
            .size_bytes(value(Metric::Size))
            .table_count(value(Metric::Tables))
            .procedure_count(value(Metric::Procedures))
            .function_count(value(Metric::Functions))
            .view_count(value(Metric::Views))
            .user_grant_count(value(Metric::Grants))
            .maybe_error((!errors.is_empty()).then(|| errors.iter().join("; ")))
            .build();
        debug!(
            "Collected metadata for {}: {} bytes, {} tables",
            name, record.size_bytes, record.table_count
        );
        record
    }
}

fn degrade(database: &str, metric: Metric, reason: &str, errors: &mut Vec<String>) {
    if metric.is_critical() {
        warn!("Metadata query {metric} failed for {database}: {reason}");
        errors.push(format!("{metric}: {reason}"));
    } else {
        debug!("Metadata query {metric} failed for {database}, using 0: {reason}");
    }
}
