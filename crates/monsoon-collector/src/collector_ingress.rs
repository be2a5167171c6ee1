//! Ingress filtering and normalization for raw chat events.
//!
//! Events are kept only when they belong to the tracked conversation, then
//! reduced to the normalized shape aggregation consumes. Malformed events are
//! dropped permanently here: without a sender or timestamp there is nothing
//! to report against or retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collector_contract::{NormalizedMessage, RawChatEvent, MAX_MESSAGE_TEXT_CHARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How an event's conversation id is matched against the tracked id.
///
/// `Exact` suits deployments keyed by a full group JID; `Contains` suits
/// providers that wrap the id in routing prefixes or suffixes.
pub enum ConversationMatchMode {
    Exact,
    Contains,
}

impl ConversationMatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone)]
/// Ingress configuration: which conversation to track and how to match it.
pub struct IngressConfig {
    pub conversation_id: String,
    pub match_mode: ConversationMatchMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Counters and survivors of one normalization pass.
pub struct IngressOutcome {
    pub messages: Vec<NormalizedMessage>,
    pub matched: usize,
    pub dropped_invalid: usize,
}

pub fn event_matches_conversation(config: &IngressConfig, event: &RawChatEvent) -> bool {
    match config.match_mode {
        ConversationMatchMode::Exact => event.conversation_id == config.conversation_id,
        ConversationMatchMode::Contains => {
            event.conversation_id.contains(&config.conversation_id)
        }
    }
}

/// Reduces one raw event to the normalized shape. The sender id falls back
/// from the participant id to the conversation id (direct chats have no
/// separate participant), text is capped at the storage column width on a
/// character boundary, and the protocol timestamp becomes an absolute instant.
pub fn normalize_chat_event(event: &RawChatEvent) -> NormalizedMessage {
    let sender_id = event
        .participant_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| event.conversation_id.clone());
    let text = truncate_chars(event.text.as_deref().unwrap_or(""), MAX_MESSAGE_TEXT_CHARS);
    let timestamp = DateTime::<Utc>::from_timestamp(
        i64::try_from(event.timestamp_unix).unwrap_or(i64::MAX),
        0,
    )
    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let valid = !sender_id.is_empty() && !text.is_empty() && event.timestamp_unix > 0;
    NormalizedMessage {
        sender_id,
        sender_name: event.push_name.clone().unwrap_or_default(),
        text,
        timestamp,
        valid,
    }
}

/// Filters a batch to the tracked conversation and drops invalid survivors,
/// preserving arrival order for the aggregation step.
pub fn normalize_batch(config: &IngressConfig, events: &[RawChatEvent]) -> IngressOutcome {
    let mut outcome = IngressOutcome::default();
    for event in events {
        if !event_matches_conversation(config, event) {
            continue;
        }
        outcome.matched += 1;
        let message = normalize_chat_event(event);
        if !message.valid {
            outcome.dropped_invalid += 1;
            debug!(
                conversation_id = %event.conversation_id,
                timestamp_unix = event.timestamp_unix,
                "dropping malformed chat event"
            );
            continue;
        }
        outcome.messages.push(message);
    }
    outcome
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
