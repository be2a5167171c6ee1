//! The `monsoon` binary: wires the chat-event source, the collector runtime,
//! and the delivery retry timer together around one storage backend.
//!
//! The chat-protocol client itself lives outside this process; whatever
//! bridges it emits NDJSON chat-event lines that arrive here through a file
//! or stdin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use monsoon_collector::{
    parse_timezone, ChatSourceEvent, CollectorRuntime, CollectorRuntimeConfig,
    ConversationMatchMode, DeliveryConfig, DeliveryWorker, HttpStorageBackend,
    HttpStorageBackendConfig, IngressConfig, MemoryStorageBackend, RawChatEvent,
    SenderAnonymizer, StorageBackend, run_delivery_retry_loop, DEFAULT_BACKLOG_CAP,
    DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_STORAGE_HTTP_TIMEOUT_MS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliMatchMode {
    Exact,
    Contains,
}

impl From<CliMatchMode> for ConversationMatchMode {
    fn from(value: CliMatchMode) -> Self {
        match value {
            CliMatchMode::Exact => ConversationMatchMode::Exact,
            CliMatchMode::Contains => ConversationMatchMode::Contains,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "monsoon",
    about = "Collects group-chat rainfall reports into daily per-sender records",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "MONSOON_CONVERSATION_ID",
        help = "Identifier of the tracked group conversation"
    )]
    conversation_id: String,

    #[arg(
        long,
        env = "MONSOON_MATCH_MODE",
        value_enum,
        default_value = "exact",
        help = "How event conversation ids are matched against the tracked id"
    )]
    match_mode: CliMatchMode,

    #[arg(
        long,
        env = "MONSOON_BACKEND_URL",
        default_value = "",
        help = "Base URL of the storage backend; may be empty with --dry-run"
    )]
    backend_url: String,

    #[arg(
        long,
        env = "MONSOON_HASH_SECRET",
        hide_env_values = true,
        help = "Shared secret keying the sender-id anonymizer"
    )]
    hash_secret: String,

    #[arg(
        long,
        env = "MONSOON_TIMEZONE",
        default_value = "Asia/Kolkata",
        help = "IANA timezone used for calendar-day bucketing"
    )]
    timezone: String,

    #[arg(
        long,
        env = "MONSOON_FLUSH_INTERVAL_SECS",
        default_value_t = DEFAULT_FLUSH_INTERVAL_SECS,
        help = "Seconds between retry attempts for an undelivered backlog"
    )]
    flush_interval_secs: u64,

    #[arg(
        long,
        env = "MONSOON_HTTP_TIMEOUT_MS",
        default_value_t = DEFAULT_STORAGE_HTTP_TIMEOUT_MS,
        help = "Per-request timeout for storage backend calls"
    )]
    http_timeout_ms: u64,

    #[arg(
        long,
        env = "MONSOON_BACKLOG_CAP",
        default_value_t = DEFAULT_BACKLOG_CAP,
        help = "Maximum records held for retry before the oldest are dropped"
    )]
    backlog_cap: usize,

    #[arg(
        long,
        env = "MONSOON_STATE_DIR",
        help = "Directory for the backlog journal; omit to keep the backlog memory-only"
    )]
    state_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "MONSOON_INGRESS",
        default_value = "-",
        help = "NDJSON chat-event source: a file path, or '-' for stdin"
    )]
    ingress: String,

    #[arg(
        long,
        help = "Collect into an in-process store instead of the HTTP backend"
    )]
    dry_run: bool,
}

/// One line of the ingress stream. Unknown or malformed lines are skipped;
/// the bridge process may interleave its own diagnostics.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum IngressLine {
    HistorySync { events: Vec<RawChatEvent> },
    Message { event: RawChatEvent },
    ConnectionClosed {
        #[serde(default)]
        reason: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let timezone = parse_timezone(&cli.timezone)?;

    let backend: Arc<dyn StorageBackend> = if cli.dry_run {
        Arc::new(MemoryStorageBackend::new())
    } else {
        Arc::new(HttpStorageBackend::new(HttpStorageBackendConfig {
            base_url: cli.backend_url.clone(),
            http_timeout_ms: cli.http_timeout_ms,
        })?)
    };

    let worker = Arc::new(DeliveryWorker::new(
        Arc::clone(&backend),
        DeliveryConfig {
            backlog_cap: cli.backlog_cap,
            journal_dir: cli.state_dir.clone(),
        },
    )?);

    let runtime = CollectorRuntime::new(
        CollectorRuntimeConfig {
            ingress: IngressConfig {
                conversation_id: cli.conversation_id.clone(),
                match_mode: cli.match_mode.into(),
            },
            timezone,
        },
        SenderAnonymizer::new(cli.hash_secret.clone()),
        Arc::clone(&backend),
        Arc::clone(&worker),
    );

    let (event_tx, event_rx) = mpsc::channel(64);
    let source = tokio::spawn(run_ingress_source(cli.ingress.clone(), event_tx));
    let retry = tokio::spawn(run_delivery_retry_loop(
        Arc::clone(&worker),
        Duration::from_secs(cli.flush_interval_secs.max(1)),
    ));

    let result = runtime.run(event_rx).await;
    retry.abort();
    source.abort();

    let summary = result?;
    println!("{}", summary.summary_line());
    Ok(())
}

/// Feeds the runtime from the configured NDJSON source. Errors never escape:
/// they become a fatal `ConnectionClosed` so the runtime can flush and exit.
async fn run_ingress_source(ingress: String, sender: mpsc::Sender<ChatSourceEvent>) {
    let result = if ingress == "-" {
        // Stdin is the live bridge: EOF there means the upstream client died.
        stream_lines(BufReader::new(tokio::io::stdin()), &sender, true).await
    } else {
        match tokio::fs::File::open(&ingress)
            .await
            .with_context(|| format!("failed to open ingress file '{ingress}'"))
        {
            Ok(file) => stream_lines(BufReader::new(file), &sender, false).await,
            Err(error) => Err(error),
        }
    };
    if let Err(error) = result {
        let _ = sender
            .send(ChatSourceEvent::ConnectionClosed {
                reason: error.to_string(),
            })
            .await;
    }
}

async fn stream_lines<R: AsyncBufRead + Unpin>(
    reader: R,
    sender: &mpsc::Sender<ChatSourceEvent>,
    close_on_eof: bool,
) -> Result<()> {
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("failed to read ingress line")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<IngressLine>(line) {
            Ok(IngressLine::HistorySync { events }) => ChatSourceEvent::HistorySync(events),
            Ok(IngressLine::Message { event }) => ChatSourceEvent::Messages(vec![event]),
            Ok(IngressLine::ConnectionClosed { reason }) => {
                let _ = sender
                    .send(ChatSourceEvent::ConnectionClosed { reason })
                    .await;
                return Ok(());
            }
            Err(error) => {
                debug!(%error, "skipping malformed ingress line");
                continue;
            }
        };
        if sender.send(event).await.is_err() {
            warn!("runtime dropped the event channel, stopping ingress source");
            return Ok(());
        }
    }
    if close_on_eof {
        let _ = sender
            .send(ChatSourceEvent::ConnectionClosed {
                reason: "ingress stream ended".to_string(),
            })
            .await;
    }
    Ok(())
}
