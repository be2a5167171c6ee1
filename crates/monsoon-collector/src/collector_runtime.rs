//! Collector runtime: the single consumer of the chat-event channel.
//!
//! The protocol-client adapter pushes events into an mpsc channel; one task
//! drains it, runs filter/normalize/aggregate, and hands records to the
//! delivery worker. A single consumer keeps the "one delivery attempt at a
//! time" ordering without the adapter ever touching shared state.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::collector_aggregate::aggregate_daily;
use crate::collector_anonymizer::SenderAnonymizer;
use crate::collector_contract::RawChatEvent;
use crate::collector_delivery::{DeliveryOutcome, DeliveryWorker};
use crate::collector_ingress::{normalize_batch, IngressConfig};
use crate::collector_store::StorageBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
/// What the chat-protocol adapter can hand the runtime.
pub enum ChatSourceEvent {
    /// Bulk backfill of historical events, subject to the history window.
    HistorySync(Vec<RawChatEvent>),
    /// Incremental new-message delivery, never window-filtered.
    Messages(Vec<RawChatEvent>),
    /// The upstream connection is gone; the runtime flushes and exits for
    /// external supervision to restart the process.
    ConnectionClosed { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Counters accumulated over one runtime lifetime.
pub struct CollectorRunSummary {
    pub events_seen: usize,
    pub events_matched: usize,
    pub events_window_skipped: usize,
    pub events_malformed: usize,
    pub records_aggregated: usize,
    pub batches_delivered: usize,
    pub failed_attempts: usize,
    pub records_evicted: usize,
}

impl CollectorRunSummary {
    pub fn summary_line(&self) -> String {
        format!(
            "collector summary: events={} matched={} window_skipped={} malformed={} aggregated={} delivered_batches={} failed_attempts={} evicted={}",
            self.events_seen,
            self.events_matched,
            self.events_window_skipped,
            self.events_malformed,
            self.records_aggregated,
            self.batches_delivered,
            self.failed_attempts,
            self.records_evicted
        )
    }
}

#[derive(Debug, Clone)]
pub struct CollectorRuntimeConfig {
    pub ingress: IngressConfig,
    pub timezone: Tz,
}

/// Drives the pipeline for one process lifetime.
pub struct CollectorRuntime {
    config: CollectorRuntimeConfig,
    anonymizer: SenderAnonymizer,
    backend: Arc<dyn StorageBackend>,
    worker: Arc<DeliveryWorker>,
    summary: CollectorRunSummary,
    history_floor: Option<DateTime<Utc>>,
}

impl CollectorRuntime {
    pub fn new(
        config: CollectorRuntimeConfig,
        anonymizer: SenderAnonymizer,
        backend: Arc<dyn StorageBackend>,
        worker: Arc<DeliveryWorker>,
    ) -> Self {
        Self {
            config,
            anonymizer,
            backend,
            worker,
            summary: CollectorRunSummary::default(),
            history_floor: None,
        }
    }

    /// Consumes the event channel until it closes (source drained) or a
    /// fatal `ConnectionClosed` arrives. Either way the backlog gets one
    /// final delivery attempt before the call returns.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ChatSourceEvent>,
    ) -> Result<CollectorRunSummary> {
        self.history_floor = match self.backend.last_delivered_timestamp().await {
            Ok(floor) => floor,
            Err(error) => {
                warn!(%error, "could not query last delivered timestamp, replaying full history");
                None
            }
        };
        if let Some(floor) = self.history_floor {
            info!(%floor, "resuming history ingestion after last delivered timestamp");
        }

        while let Some(event) = events.recv().await {
            match event {
                ChatSourceEvent::HistorySync(batch) => self.ingest(batch, true).await,
                ChatSourceEvent::Messages(batch) => self.ingest(batch, false).await,
                ChatSourceEvent::ConnectionClosed { reason } => {
                    warn!(reason = %reason, "chat source connection closed");
                    self.flush().await;
                    info!("{}", self.summary.summary_line());
                    bail!("chat source connection closed: {reason}");
                }
            }
        }

        self.flush().await;
        Ok(self.summary)
    }

    async fn ingest(&mut self, batch: Vec<RawChatEvent>, history: bool) {
        self.summary.events_seen += batch.len();
        let batch = if history {
            self.apply_history_window(batch)
        } else {
            batch
        };
        let outcome = normalize_batch(&self.config.ingress, &batch);
        self.summary.events_matched += outcome.matched;
        self.summary.events_malformed += outcome.dropped_invalid;

        let records = aggregate_daily(&self.anonymizer, self.config.timezone, &outcome.messages);
        self.summary.records_aggregated += records.len();

        let report = self.worker.deliver(records).await;
        self.summary.records_evicted += report.evicted;
        match report.outcome {
            DeliveryOutcome::Delivered => self.summary.batches_delivered += 1,
            DeliveryOutcome::Failed => self.summary.failed_attempts += 1,
            DeliveryOutcome::Skipped => {}
        }
    }

    /// Drops history events at or before the last delivered instant; they are
    /// already stored (or were aggregated into records that are), so
    /// replaying them would only re-deliver old days.
    fn apply_history_window(&mut self, batch: Vec<RawChatEvent>) -> Vec<RawChatEvent> {
        let Some(floor) = self.history_floor else {
            return batch;
        };
        let floor_unix = u64::try_from(floor.timestamp()).unwrap_or(0);
        let before = batch.len();
        let batch: Vec<RawChatEvent> = batch
            .into_iter()
            .filter(|event| event.timestamp_unix > floor_unix)
            .collect();
        self.summary.events_window_skipped += before - batch.len();
        batch
    }

    async fn flush(&mut self) {
        let report = self.worker.deliver(Vec::new()).await;
        self.summary.records_evicted += report.evicted;
        match report.outcome {
            DeliveryOutcome::Delivered => self.summary.batches_delivered += 1,
            DeliveryOutcome::Failed => {
                warn!(
                    pending = report.backlog_len,
                    "final flush failed, backlog left for the journal"
                );
                self.summary.failed_attempts += 1;
            }
            DeliveryOutcome::Skipped => {}
        }
    }
}
