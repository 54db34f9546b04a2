//! Batch runner over a list of vulnerability records.
//!
//! Every processed record appends one row to `output/<project>/result.txt`:
//!
//! ```text
//! vid,status,token,time,testcase_token,poc_token,testcase_time,poc_time
//! ```
//!
//! Records that already have a row are skipped, so an interrupted batch can
//! simply be restarted.

use crate::callers::CallerResolver;
use crate::config::Config;
use crate::index::SymbolSource;
use crate::oracle::Oracle;
use crate::orchestrator::SubprocessOrchestrator;
use crate::search::{run_session, BuildOutcome, EntryConfirmer, SearchContext, VulnRecord};
use crate::store::{fold_tokens, keys, reset_session, CounterStore};
use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Status {
    FalsePositive,
    MayVulnerability,
    /// The search itself failed
    Unresolved,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FalsePositive => "FalsePositive",
            Self::MayVulnerability => "MayVulnerability",
            Self::Unresolved => "Unresolved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub vid: String,
    pub status: Status,
    pub token: f64,
    pub time: f64,
    pub testcase_token: f64,
    pub poc_token: f64,
    pub testcase_time: f64,
    pub poc_time: f64,
}

impl ResultRow {
    /// Row for a record whose search never finished.
    pub fn unresolved(vid: &str) -> Self {
        Self {
            vid: vid.to_string(),
            status: Status::Unresolved,
            token: 0.0,
            time: 0.0,
            testcase_token: 0.0,
            poc_token: 0.0,
            testcase_time: 0.0,
            poc_time: 0.0,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{:.2},{},{},{:.2},{:.2}",
            self.vid,
            self.status,
            self.token,
            self.time,
            self.testcase_token,
            self.poc_token,
            self.testcase_time,
            self.poc_time
        )
    }
}

/// Ids that already have a row in `path`.
pub fn completed_ids(path: &Path) -> anyhow::Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .filter_map(|line| line.split(',').next())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn append_row(path: &Path, row: &ResultRow) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", row.to_line())?;
    Ok(())
}

#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub statuses: BTreeMap<String, usize>,
    pub finished_at: String,
}

pub struct BatchRunner<'a> {
    config: &'a Config,
    config_path: Option<PathBuf>,
    oracle: &'a dyn Oracle,
    callers: &'a dyn CallerResolver,
    symbols: &'a dyn SymbolSource,
    store: Arc<dyn CounterStore>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        config: &'a Config,
        config_path: Option<&Path>,
        oracle: &'a dyn Oracle,
        callers: &'a dyn CallerResolver,
        symbols: &'a dyn SymbolSource,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            config,
            config_path: config_path.map(Path::to_path_buf),
            oracle,
            callers,
            symbols,
            store,
        }
    }

    pub async fn run(&self, records: &[VulnRecord]) -> anyhow::Result<BatchSummary> {
        let layout = self.config.layout();
        let result_file = layout.result_file();
        let done = completed_ids(&result_file)?;
        let mut summary = BatchSummary {
            total: records.len(),
            ..BatchSummary::default()
        };

        for record in records {
            if done.contains(&record.id) {
                info!(session = %record.id, "already processed, skipping");
                summary.skipped += 1;
                continue;
            }
            let row = match AssertUnwindSafe(self.run_one(record)).catch_unwind().await {
                Ok(row) => row?,
                Err(panic) => {
                    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic payload".to_string()
                    };
                    error!(session = %record.id, "search panicked: {}", detail);
                    ResultRow::unresolved(&record.id)
                }
            };
            append_row(&result_file, &row)?;
            *summary.statuses.entry(row.status.to_string()).or_default() += 1;
            summary.processed += 1;
        }

        summary.finished_at = Utc::now().to_rfc3339();
        let output_dir = layout.output_dir();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        let summary_path = output_dir.join("summary.json");
        fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("Failed to write {}", summary_path.display()))?;
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            "batch finished"
        );
        Ok(summary)
    }

    /// Search one record from a clean session and report its row without
    /// recording it.
    pub async fn run_one(&self, record: &VulnRecord) -> anyhow::Result<ResultRow> {
        let layout = self.config.layout();
        let extra_dir = layout.extra_dir(&record.id);
        if extra_dir.exists() {
            fs::remove_dir_all(&extra_dir)
                .with_context(|| format!("Failed to clear {}", extra_dir.display()))?;
        }
        reset_session(self.store.as_ref())?;
        self.store.set(keys::FUNCTION_NAME, &record.function, None)?;
        self.store.set(keys::SINK_CODE, &record.sink_code(), None)?;

        let started = Instant::now();
        let orchestrator = match SubprocessOrchestrator::new(
            self.config,
            self.config_path.as_deref(),
            self.store.clone(),
            &record.id,
        ) {
            Ok(orchestrator) => Some(orchestrator),
            Err(err) => {
                warn!(session = %record.id, "agents unavailable: {:#}", err);
                None
            }
        };
        let confirmer = orchestrator
            .as_ref()
            .filter(|_| self.config.search.confirm_entry_points)
            .map(|o| o as &dyn EntryConfirmer);

        let ctx = SearchContext {
            config: self.config,
            oracle: self.oracle,
            callers: self.callers,
            symbols: self.symbols,
            confirmer,
        };

        let status = match run_session(&ctx, record).await {
            Ok(session) => {
                if let (BuildOutcome::Exhausted { .. }, false, Some(orchestrator)) =
                    (&session.outcome, session.extras.is_empty(), orchestrator.clone())
                {
                    let entry = record.function.clone();
                    let confirmed =
                        tokio::task::spawn_blocking(move || orchestrator.run_chains(&entry)).await;
                    match confirmed {
                        Ok(Ok(confirmed)) => {
                            info!(session = %record.id, confirmed, "chain agents finished")
                        }
                        Ok(Err(err)) => warn!(session = %record.id, "chain agents failed: {:#}", err),
                        Err(err) => warn!(session = %record.id, "chain agents panicked: {}", err),
                    }
                }
                if layout.prune_marker(&record.id).exists() {
                    Status::FalsePositive
                } else {
                    Status::MayVulnerability
                }
            }
            Err(err) => {
                error!(session = %record.id, "search failed: {:#}", err);
                Status::Unresolved
            }
        };

        let store = self.store.as_ref();
        fold_tokens(store, keys::PATH_AGENT_TOKEN)?;
        let path_tokens = store.get_f64(keys::PATH_AGENT_TOKEN);
        let testcase_token = store.get_f64(keys::TESTCASE_TOKEN);
        let poc_token = store.get_f64(keys::POC_TOKEN);
        Ok(ResultRow {
            vid: record.id.clone(),
            status,
            token: path_tokens + testcase_token + poc_token,
            time: started.elapsed().as_secs_f64(),
            testcase_token,
            poc_token,
            testcase_time: store.get_f64(keys::TESTCASE_TIME),
            poc_time: store.get_f64(keys::POC_TIME),
        })
    }
}
