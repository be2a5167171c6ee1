//! Data contract for the collector pipeline.
//!
//! Raw provider events are tolerant serde shapes that accept whatever the
//! chat-protocol adapter emits; normalized and aggregated records are the
//! stable tuples the storage backend dedupes on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message bodies are capped to the storage column width before aggregation.
pub const MAX_MESSAGE_TEXT_CHARS: usize = 2000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// One raw event as delivered by the chat-protocol adapter. Consumed once by
/// ingress normalization; absent fields default rather than fail the line.
pub struct RawChatEvent {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub timestamp_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A raw event reduced to the fields aggregation cares about. `valid` is true
/// iff sender id and text are non-empty and the protocol timestamp is
/// non-zero; invalid messages never reach aggregation.
pub struct NormalizedMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
/// One sender's concatenated text for one calendar day.
///
/// The whole field tuple is the storage dedup key, so equality and ordering
/// cover every field; the timestamp leads the derived ordering so a
/// `BTreeSet` backlog iterates oldest-first.
pub struct AggregatedRecord {
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
}
