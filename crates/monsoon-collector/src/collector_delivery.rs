//! Delivery queue and worker: the at-least-once bridge to the storage backend.
//!
//! Two callers feed `deliver`: the ingestion path right after each
//! aggregation pass, and the retry timer with an empty batch. Both funnel
//! through one mutex held across the insert call, so delivery attempts
//! serialize in arrival order; a failed attempt keeps the whole batch in the
//! backlog for whichever trigger fires next.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use monsoon_core::write_text_atomic;

use crate::collector_contract::AggregatedRecord;
use crate::collector_store::StorageBackend;

pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BACKLOG_CAP: usize = 10_000;

const BACKLOG_JOURNAL_FILE: &str = "backlog.ndjson";

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Hard bound on backlog size; oldest records are evicted past it.
    pub backlog_cap: usize,
    /// Directory for the backlog journal. `None` keeps the backlog
    /// memory-only, losing it on restart.
    pub journal_dir: Option<PathBuf>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backlog_cap: DEFAULT_BACKLOG_CAP,
            journal_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of one `deliver` call.
pub enum DeliveryOutcome {
    /// Nothing pending and nothing new: no backend call was made.
    Skipped,
    Delivered,
    /// The attempted batch is retained in the backlog for the next trigger.
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    pub attempted: usize,
    pub backlog_len: usize,
    pub evicted: usize,
}

struct DeliveryState {
    backlog: BTreeSet<AggregatedRecord>,
}

/// Owns the backlog and the only path to the storage backend.
///
/// Constructor-injected state: there is exactly one worker per process and
/// every caller shares it behind an `Arc`.
pub struct DeliveryWorker {
    backend: Arc<dyn StorageBackend>,
    config: DeliveryConfig,
    state: Mutex<DeliveryState>,
}

impl DeliveryWorker {
    /// Builds the worker, reloading any journaled backlog from a previous
    /// process so undelivered records survive restarts.
    pub fn new(backend: Arc<dyn StorageBackend>, config: DeliveryConfig) -> Result<Self> {
        if config.backlog_cap == 0 {
            anyhow::bail!("delivery backlog cap must be greater than 0");
        }
        let backlog = match &config.journal_dir {
            Some(dir) => load_backlog_journal(dir)?,
            None => BTreeSet::new(),
        };
        if !backlog.is_empty() {
            info!(pending = backlog.len(), "restored backlog from journal");
        }
        Ok(Self {
            backend,
            config,
            state: Mutex::new(DeliveryState { backlog }),
        })
    }

    pub async fn backlog_len(&self) -> usize {
        self.state.lock().await.backlog.len()
    }

    /// Merges `new_records` into the backlog and attempts one delivery.
    ///
    /// The lock is held for the whole merge-attempt-update sequence,
    /// including the network call: delivery volume is small periodic batches,
    /// and serializing attempts is what keeps the backlog's single-writer
    /// invariant. A concurrent caller waits and then runs its own attempt;
    /// calls are never coalesced away.
    pub async fn deliver(&self, new_records: Vec<AggregatedRecord>) -> DeliveryReport {
        let mut state = self.state.lock().await;
        state.backlog.extend(new_records);
        let evicted = enforce_backlog_cap(&mut state.backlog, self.config.backlog_cap);
        if evicted > 0 {
            warn!(
                evicted,
                cap = self.config.backlog_cap,
                "backlog over cap, evicted oldest records"
            );
        }

        if state.backlog.is_empty() {
            return DeliveryReport {
                outcome: DeliveryOutcome::Skipped,
                attempted: 0,
                backlog_len: 0,
                evicted,
            };
        }

        let batch: Vec<AggregatedRecord> = state.backlog.iter().cloned().collect();
        let attempted = batch.len();
        let success = match self.backend.insert_batch(&batch).await {
            Ok(outcome) => outcome.success,
            Err(error) => {
                debug!(%error, "storage insert errored");
                false
            }
        };

        let outcome = if success {
            state.backlog.clear();
            info!(attempted, backlog = 0usize, "delivery attempt succeeded");
            DeliveryOutcome::Delivered
        } else {
            // The backend reports no partial success, so the entire attempted
            // batch stays queued; the next trigger retries it plus anything new.
            warn!(
                attempted,
                backlog = state.backlog.len(),
                "delivery attempt failed, batch kept for retry"
            );
            DeliveryOutcome::Failed
        };

        if let Err(error) = self.persist_journal(&state) {
            warn!(%error, "failed to persist backlog journal");
        }

        DeliveryReport {
            outcome,
            attempted,
            backlog_len: state.backlog.len(),
            evicted,
        }
    }

    fn persist_journal(&self, state: &DeliveryState) -> Result<()> {
        let Some(dir) = &self.config.journal_dir else {
            return Ok(());
        };
        let mut content = String::new();
        for record in &state.backlog {
            content.push_str(&serde_json::to_string(record).context("serialize backlog record")?);
            content.push('\n');
        }
        write_text_atomic(&dir.join(BACKLOG_JOURNAL_FILE), &content)
    }
}

fn enforce_backlog_cap(backlog: &mut BTreeSet<AggregatedRecord>, cap: usize) -> usize {
    let mut evicted = 0usize;
    while backlog.len() > cap {
        // The record ordering leads with the timestamp, so the first element
        // is the oldest pending record.
        let Some(oldest) = backlog.iter().next().cloned() else {
            break;
        };
        backlog.remove(&oldest);
        evicted += 1;
    }
    evicted
}

fn load_backlog_journal(dir: &Path) -> Result<BTreeSet<AggregatedRecord>> {
    let path = dir.join(BACKLOG_JOURNAL_FILE);
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut backlog = BTreeSet::new();
    let mut malformed = 0usize;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AggregatedRecord>(line) {
            Ok(record) => {
                backlog.insert(record);
            }
            Err(_) => malformed = malformed.saturating_add(1),
        }
    }
    if malformed > 0 {
        warn!(malformed, "skipped malformed backlog journal lines");
    }
    Ok(backlog)
}

/// Periodic retry driver: every `flush_interval` it hands the worker an empty
/// batch so a previously failed backlog gets another attempt. Runs until the
/// owning task is aborted.
pub async fn run_delivery_retry_loop(worker: Arc<DeliveryWorker>, flush_interval: Duration) {
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let pending = worker.backlog_len().await;
        if pending == 0 {
            continue;
        }
        debug!(pending, "retrying pending backlog");
        worker.deliver(Vec::new()).await;
    }
}
