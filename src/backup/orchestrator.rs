use crate::backup::admission::{
    check_capacity, AdmissionResult, CompressionRatioTable, FreeSpaceProbe, FsFreeSpace,
};
use crate::backup::backup_config::{format_timestamp, BackupConfig};
use crate::backup::cancel::CancelToken;
use crate::backup::dump_command::{DumpCommandFactory, DumpTarget};
use crate::backup::filter::{filter_databases, FilterStats};
use crate::backup::metadata::{DatabaseMetadata, MetadataCollector, MetadataSource};
use crate::backup::pipeline::{run_unit, UnitReport};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::validate::validate_writable_dir;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactMode {
    /// One artifact per database
    #[default]
    Separate,
    /// One artifact holding every selected database
    Combined,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RunState {
    Filtering,
    Estimating,
    PerUnitExecution,
    Aggregating,
    Done,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[display("success")]
    Success,
    #[display("success with warnings")]
    SuccessWithWarnings,
    #[display("failed")]
    Failed,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[display("success")]
    Success,
    #[display("success with warnings")]
    SuccessWithWarnings,
    #[display("partial")]
    Partial,
    #[display("failed")]
    Failed,
    #[display("aborted")]
    Aborted,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    #[display("configuration error")]
    Configuration,
    #[display("database listing failed")]
    ListingFailed,
    #[display("no eligible databases")]
    NoDatabases,
    #[display("insufficient disk space")]
    NoSpace,
    #[display("cancelled")]
    Cancelled,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct BackupUnitOutcome {
    #[getset(get = "pub")]
    databases: Vec<String>,
    #[getset(get = "pub")]
    output_path: PathBuf,
    #[getset(get_copy = "pub")]
    byte_size: u64,
    #[getset(get_copy = "pub")]
    #[serde(with = "humantime_serde")]
    duration: Duration,
    #[getset(get_copy = "pub")]
    status: UnitStatus,
    #[getset(get = "pub")]
    warnings: Option<String>,
    #[getset(get = "pub")]
    error: Option<String>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    /// Run-level error behind an abort
    pub error: Option<String>,
    pub filter_stats: Option<FilterStats>,
    #[serde(default)]
    pub metadata: BTreeMap<String, DatabaseMetadata>,
    pub admission: Option<AdmissionResult>,
    #[serde(default)]
    pub units: Vec<BackupUnitOutcome>,
}

impl RunSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            status: RunStatus::Aborted,
            abort_reason: None,
            error: None,
            filter_stats: None,
            metadata: BTreeMap::new(),
            admission: None,
            units: Vec::new(),
        }
    }

    /// Summary of a run that stopped before producing any unit.
    pub fn aborted(started_at: DateTime<Utc>, reason: AbortReason, error: &Error) -> Self {
        let mut summary = Self::new(started_at);
        summary.abort(reason, error);
        summary.finished_at = Utc::now();
        summary
    }

    fn abort(&mut self, reason: AbortReason, error: &Error) {
        error!("Backup run aborted ({reason}): {error}");
        self.status = RunStatus::Aborted;
        self.abort_reason = Some(reason);
        self.error = Some(error.to_string());
    }

    fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    pub fn successes(&self) -> usize {
        self.count(UnitStatus::Success)
    }

    pub fn warnings(&self) -> usize {
        self.count(UnitStatus::SuccessWithWarnings)
    }

    pub fn failures(&self) -> usize {
        self.count(UnitStatus::Failed)
    }

    /// True when every unit produced a usable artifact.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Success | RunStatus::SuccessWithWarnings
        )
    }

    /// Writes the summary as `backup-summary.<timestamp>.json` into `dir`.
    pub fn persist<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let path = dir.as_ref().join(format!(
            "backup-summary.{}.json",
            format_timestamp(&self.started_at)
        ));
        let mut writer = BufWriter::new(
            File::create(&path)
                .map_err(Error::from)
                .with_msg(format!("Create run summary failed: {path:?}"))?,
        );
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(path)
    }

    pub fn log(&self) {
        for unit in &self.units {
            match unit.status {
                UnitStatus::Failed => error!(
                    "{}: {} ({})",
                    unit.databases.join(","),
                    unit.status,
                    unit.error.as_deref().unwrap_or_default()
                ),
                _ => info!(
                    "{}: {} -> {:?}, {} bytes in {:?}",
                    unit.databases.join(","),
                    unit.status,
                    unit.output_path,
                    unit.byte_size,
                    unit.duration
                ),
            }
        }
        match self.abort_reason {
            Some(reason) => error!(
                "Backup run aborted: {} ({})",
                reason,
                self.error.as_deref().unwrap_or_default()
            ),
            None => info!(
                "Backup run {}: {} succeeded, {} with warnings, {} failed",
                self.status,
                self.successes(),
                self.warnings(),
                self.failures()
            ),
        }
    }
}

struct BackupUnit {
    name: String,
    /// File name stem, unique within the run
    stem: String,
    databases: Vec<String>,
    target: DumpTarget,
}

/// Drives one backup run through filtering, estimating, per-unit execution
/// and aggregation. Every run, aborted or not, produces a [`RunSummary`].
#[derive(Builder)]
pub struct BackupEngine {
    config: BackupConfig,
    source: Arc<dyn MetadataSource>,
    dump_command: Arc<dyn DumpCommandFactory>,
    #[builder(default = Arc::new(FsFreeSpace))]
    free_space: Arc<dyn FreeSpaceProbe>,
    #[builder(default)]
    ratios: CompressionRatioTable,
}

impl BackupEngine {
    pub fn run(&self, cancel: &CancelToken) -> RunSummary {
        let mut summary = RunSummary::new(Utc::now());
        if let Err((reason, e)) = self.run_stages(cancel, &mut summary) {
            summary.abort(reason, &e);
        }
        summary.finished_at = Utc::now();
        enter(RunState::Done);
        summary
    }

    fn run_stages(
        &self,
        cancel: &CancelToken,
        summary: &mut RunSummary,
    ) -> std::result::Result<(), (AbortReason, Error)> {
        let config = &self.config;
        let abort = |reason: AbortReason| move |e: Error| (reason, e);

        enter(RunState::Filtering);
        validate_writable_dir(&config.out_dir)
            .map_err(|e| Error::InvalidConfig(e.to_string()))
            .map_err(abort(AbortReason::Configuration))?;
        config
            .encryptor
            .check_key()
            .map_err(abort(AbortReason::Configuration))?;
        let rule = config
            .filter
            .to_rule()
            .map_err(abort(AbortReason::Configuration))?;
        let names = self
            .source
            .list_databases()
            .map_err(abort(AbortReason::ListingFailed))?;
        let (included, stats) = match filter_databases(&names, &rule) {
            Ok(filtered) => filtered,
            Err(Error::NoEligibleDatabases(stats)) => {
                summary.filter_stats = Some(stats.clone());
                return Err((AbortReason::NoDatabases, Error::NoEligibleDatabases(stats)));
            }
            Err(e) => return Err((AbortReason::Configuration, e)),
        };
        summary.filter_stats = Some(stats.clone());
        check_cancel(cancel)?;

        enter(RunState::Estimating);
        let collector = MetadataCollector::builder()
            .source(Arc::clone(&self.source))
            .maybe_workers(config.collector.workers)
            .query_timeout(config.collector.query_timeout)
            .job_timeout(config.collector.job_timeout)
            .build();
        let metadata = collector.collect(cancel, &included);
        check_cancel(cancel)?;
        let admission = check_capacity(
            &config.out_dir,
            &included,
            &metadata,
            &config.capacity_config(self.ratios.clone()),
            self.free_space.as_ref(),
        )
        .map_err(abort(AbortReason::Configuration))?;
        summary.metadata = metadata.into_iter().collect();
        let sufficient = admission.ensure_sufficient();
        summary.admission = Some(admission);
        sufficient.map_err(abort(AbortReason::NoSpace))?;

        enter(RunState::PerUnitExecution);
        for unit in self.plan_units(included, &stats) {
            check_cancel(cancel)?;
            let outcome = self.execute_unit(cancel, unit);
            let failed = outcome.status == UnitStatus::Failed;
            summary.units.push(outcome);
            check_cancel(cancel)?;
            if failed && config.artifact_mode == ArtifactMode::Combined {
                break;
            }
        }

        enter(RunState::Aggregating);
        summary.status = aggregate(&summary.units);
        Ok(())
    }

    fn plan_units(&self, included: Vec<String>, stats: &FilterStats) -> Vec<BackupUnit> {
        match self.config.artifact_mode {
            ArtifactMode::Separate => {
                let mut stems = HashSet::with_capacity(included.len());
                included
                    .into_iter()
                    .map(|name| BackupUnit {
                        stem: unique_stem(&name, &mut stems),
                        target: DumpTarget::Database(name.clone()),
                        databases: vec![name.clone()],
                        name,
                    })
                    .collect()
            }
            ArtifactMode::Combined => {
                let target = if stats.excluded() == 0 {
                    DumpTarget::AllDatabases
                } else {
                    DumpTarget::Databases(included.clone())
                };
                vec![BackupUnit {
                    name: self.config.combined_artifact_name.clone(),
                    stem: self.config.combined_artifact_name.clone(),
                    databases: included,
                    target,
                }]
            }
        }
    }

    fn execute_unit(&self, cancel: &CancelToken, unit: BackupUnit) -> BackupUnitOutcome {
        let timer = Instant::now();
        let output_path = self.config.artifact_path(&unit.stem, &Utc::now());
        let transforms = self.config.transforms();
        info!("Backing up {} into {:?}", unit.name, output_path);

        let invocation = self.dump_command.invocation(&unit.target);
        let mut result = run_unit(cancel, &invocation, &output_path, &transforms);
        let retry = match &result {
            Err(e) => match e.root() {
                Error::DumpFatal { stderr, .. } => self.dump_command.degraded(&invocation, stderr),
                _ => None,
            },
            Ok(_) => None,
        };
        if let Some(reduced) = retry {
            warn!("Retrying {} with reduced dump options", unit.name);
            remove_artifact(&output_path);
            result = run_unit(cancel, &reduced, &output_path, &transforms);
        }

        // Another unit's artifact already at this path is left alone.
        let owns_output = !matches!(
            &result,
            Err(e) if matches!(e.root(), Error::Io(io) if io.kind() == ErrorKind::AlreadyExists)
        );
        let (status, warnings, error) = match result {
            Ok(UnitReport { warnings, .. }) => {
                let status = if warnings.is_some() {
                    UnitStatus::SuccessWithWarnings
                } else {
                    UnitStatus::Success
                };
                (status, warnings, None)
            }
            Err(e) => {
                error!("Backup of {} failed: {e}", unit.name);
                if owns_output && !self.config.keep_failed_artifacts {
                    remove_artifact(&output_path);
                }
                (UnitStatus::Failed, None, Some(e.to_string()))
            }
        };
        let byte_size = if owns_output {
            std::fs::metadata(&output_path)
                .map(|m| m.len())
                .unwrap_or_default()
        } else {
            0
        };

        BackupUnitOutcome {
            databases: unit.databases,
            output_path,
            byte_size,
            duration: timer.elapsed(),
            status,
            warnings,
            error,
        }
    }
}

fn enter(state: RunState) {
    info!("Backup run state: {state}");
}

fn check_cancel(cancel: &CancelToken) -> std::result::Result<(), (AbortReason, Error)> {
    if cancel.is_cancelled() {
        Err((AbortReason::Cancelled, Error::Cancelled))
    } else {
        Ok(())
    }
}

/// Sanitized `name`, suffixed with `-2`, `-3` and so on until unused.
fn unique_stem(name: &str, used: &mut HashSet<String>) -> String {
    let base = sanitize_filename::sanitize(name);
    let mut stem = base.clone();
    let mut n = 2;
    while !used.insert(stem.clone()) {
        stem = format!("{base}-{n}");
        n += 1;
    }
    stem
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!("Removed incomplete artifact {:?}", path),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove incomplete artifact {:?}: {e}", path),
    }
}

fn aggregate(units: &[BackupUnitOutcome]) -> RunStatus {
    let failed = units.iter().filter(|u| u.status == UnitStatus::Failed).count();
    if failed == units.len() {
        RunStatus::Failed
    } else if failed > 0 {
        RunStatus::Partial
    } else if units
        .iter()
        .any(|u| u.status == UnitStatus::SuccessWithWarnings)
    {
        RunStatus::SuccessWithWarnings
    } else {
        RunStatus::Success
    }
}
