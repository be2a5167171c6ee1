//! End-to-end pipeline tests: raw chat events in, deduplicated daily records
//! in the store, across failures and process restarts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use monsoon_collector::{
    AggregatedRecord, ChatSourceEvent, CollectorRuntime, CollectorRuntimeConfig,
    ConversationMatchMode, DeliveryConfig, DeliveryWorker, IngressConfig, InsertOutcome,
    MemoryStorageBackend, RawChatEvent, SenderAnonymizer, StorageBackend, StorageClientError,
};

const GROUP: &str = "rain-group@g.us";
const SECRET: &str = "integration-secret";

fn event(participant: &str, text: &str, ts: u64) -> RawChatEvent {
    RawChatEvent {
        conversation_id: GROUP.to_string(),
        participant_id: Some(participant.to_string()),
        push_name: Some(participant.to_uppercase()),
        text: Some(text.to_string()),
        timestamp_unix: ts,
    }
}

fn build_runtime(
    backend: Arc<dyn StorageBackend>,
    journal_dir: Option<std::path::PathBuf>,
) -> (CollectorRuntime, Arc<DeliveryWorker>) {
    let worker = Arc::new(
        DeliveryWorker::new(
            Arc::clone(&backend),
            DeliveryConfig {
                journal_dir,
                ..DeliveryConfig::default()
            },
        )
        .expect("worker"),
    );
    let runtime = CollectorRuntime::new(
        CollectorRuntimeConfig {
            ingress: IngressConfig {
                conversation_id: GROUP.to_string(),
                match_mode: ConversationMatchMode::Exact,
            },
            timezone: chrono_tz::Tz::UTC,
        },
        SenderAnonymizer::new(SECRET),
        backend,
        Arc::clone(&worker),
    );
    (runtime, worker)
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, d, 0, 0, 0).unwrap()
}

fn unix(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp()).unwrap()
}

/// Store wrapper that fails its first N inserts, then delegates to the
/// deduplicating in-memory store.
struct FlakyStore {
    inner: MemoryStorageBackend,
    failures_left: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl FlakyStore {
    fn failing(times: usize) -> Self {
        Self {
            inner: MemoryStorageBackend::new(),
            failures_left: AtomicUsize::new(times),
            insert_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyStore {
    async fn insert_batch(
        &self,
        records: &[AggregatedRecord],
    ) -> Result<InsertOutcome, StorageClientError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Ok(InsertOutcome {
                success: false,
                inserted: 0,
            });
        }
        self.inner.insert_batch(records).await
    }

    async fn last_delivered_timestamp(
        &self,
    ) -> Result<Option<DateTime<Utc>>, StorageClientError> {
        self.inner.last_delivered_timestamp().await
    }
}

#[tokio::test]
async fn pipeline_collapses_overlapping_history_and_live_events() {
    let store = Arc::new(MemoryStorageBackend::new());
    let (runtime, _worker) = build_runtime(Arc::clone(&store) as Arc<dyn StorageBackend>, None);
    let (tx, rx) = mpsc::channel(16);

    let d1 = day(1);
    // Farmer b's report arrives once via history sync and again as a live
    // upsert, as protocol clients routinely do after a reconnect. It
    // re-aggregates to the identical record tuple, so the second delivery is
    // a no-op at the store.
    let report_b = event("farmer-b", "5cm", unix(d1) + 7_200);
    tx.send(ChatSourceEvent::HistorySync(vec![
        event("farmer-a", "3.90 in", unix(d1) + 3_600),
        event("farmer-a", "at Village X", unix(d1) + 3_900),
        report_b.clone(),
    ]))
    .await
    .expect("send");
    tx.send(ChatSourceEvent::Messages(vec![report_b]))
        .await
        .expect("send");
    drop(tx);

    let summary = runtime.run(rx).await.expect("run");
    assert_eq!(summary.events_seen, 4);

    // Two senders, one day: exactly two rows despite the duplicate event.
    let rows = store.rows();
    assert_eq!(rows.len(), 2);
    let anonymizer = SenderAnonymizer::new(SECRET);
    let token_a = anonymizer.anonymize("farmer-a");
    let token_b = anonymizer.anonymize("farmer-b");
    assert!(rows.iter().any(|r| r.sender_id == token_a
        && r.text == "3.90 in\nat Village X"
        && r.timestamp == d1 + chrono::Duration::hours(1)));
    assert!(rows
        .iter()
        .any(|r| r.sender_id == token_b && r.text == "5cm"));
    assert!(rows.iter().all(|r| r.sender_id != "farmer-a"));
}

#[tokio::test]
async fn pipeline_redelivers_identical_batches_without_duplicate_rows() {
    let store = Arc::new(MemoryStorageBackend::new());
    let backend = Arc::clone(&store) as Arc<dyn StorageBackend>;

    let d1 = day(1);
    let records = vec![
        AggregatedRecord {
            timestamp: d1,
            sender_id: "anon-a".to_string(),
            sender_name: "A".to_string(),
            text: "3.90 in".to_string(),
        },
        AggregatedRecord {
            timestamp: d1 + chrono::Duration::hours(2),
            sender_id: "anon-b".to_string(),
            sender_name: "B".to_string(),
            text: "5cm".to_string(),
        },
    ];

    // Idempotent insert: the identical record set stored twice yields one row set.
    backend.insert_batch(&records).await.expect("first insert");
    backend.insert_batch(&records).await.expect("second insert");
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn pipeline_retries_failed_batches_until_the_store_recovers() {
    let store = Arc::new(FlakyStore::failing(2));
    let (runtime, worker) = build_runtime(Arc::clone(&store) as Arc<dyn StorageBackend>, None);
    let (tx, rx) = mpsc::channel(16);

    let d1 = day(1);
    tx.send(ChatSourceEvent::Messages(vec![event(
        "farmer-a",
        "5cm",
        unix(d1) + 3_600,
    )]))
    .await
    .expect("send");
    drop(tx);

    // First attempt fails inside the runtime; drive the retry path the way
    // the timer would until the store accepts the batch.
    let summary = runtime.run(rx).await.expect("run");
    assert!(summary.failed_attempts >= 1);

    worker.deliver(Vec::new()).await;
    worker.deliver(Vec::new()).await;

    assert_eq!(store.inner.len(), 1);
    assert!(store.insert_calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(worker.backlog_len().await, 0);
}

#[tokio::test]
async fn pipeline_journal_carries_backlog_across_restart() {
    let journal = tempfile::tempdir().expect("tempdir");
    let journal_dir = Some(journal.path().to_path_buf());

    // First process: the store is down the whole time.
    let down = Arc::new(FlakyStore::failing(usize::MAX));
    let (runtime, _worker) =
        build_runtime(Arc::clone(&down) as Arc<dyn StorageBackend>, journal_dir.clone());
    let (tx, rx) = mpsc::channel(16);
    tx.send(ChatSourceEvent::Messages(vec![event(
        "farmer-a",
        "5cm",
        unix(day(1)) + 3_600,
    )]))
    .await
    .expect("send");
    drop(tx);
    let summary = runtime.run(rx).await.expect("run");
    assert!(summary.failed_attempts >= 1);
    assert_eq!(down.inner.len(), 0);

    // Second process: healthy store, backlog restored from the journal.
    let healthy = Arc::new(MemoryStorageBackend::new());
    let (_runtime, worker) =
        build_runtime(Arc::clone(&healthy) as Arc<dyn StorageBackend>, journal_dir);
    assert_eq!(worker.backlog_len().await, 1);
    worker.deliver(Vec::new()).await;
    assert_eq!(healthy.len(), 1);
}

#[tokio::test]
async fn pipeline_resumes_history_from_last_delivered_timestamp() {
    let store = Arc::new(MemoryStorageBackend::new());
    let backend = Arc::clone(&store) as Arc<dyn StorageBackend>;

    // A previous run already stored day one.
    backend
        .insert_batch(&[AggregatedRecord {
            timestamp: day(1) + chrono::Duration::hours(1),
            sender_id: "anon-a".to_string(),
            sender_name: "A".to_string(),
            text: "old day".to_string(),
        }])
        .await
        .expect("seed");

    let (runtime, _worker) = build_runtime(Arc::clone(&backend), None);
    let (tx, rx) = mpsc::channel(16);
    tx.send(ChatSourceEvent::HistorySync(vec![
        event("farmer-a", "already stored", unix(day(1)) + 3_600),
        event("farmer-a", "new day", unix(day(2)) + 3_600),
    ]))
    .await
    .expect("send");
    drop(tx);

    let summary = runtime.run(rx).await.expect("run");
    assert_eq!(summary.events_window_skipped, 1);
    assert_eq!(summary.records_aggregated, 1);

    let texts: Vec<String> = store.rows().iter().map(|r| r.text.clone()).collect();
    assert!(texts.iter().any(|t| t == "new day"));
    assert!(!texts.iter().any(|t| t == "already stored"));
}
