//! Daily per-sender aggregation of normalized messages.
//!
//! Pure computation: each invocation re-derives its output from the messages
//! it is handed and retains nothing. Cross-invocation state (what has already
//! been delivered) is the delivery worker's job.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::collector_anonymizer::SenderAnonymizer;
use crate::collector_contract::{AggregatedRecord, NormalizedMessage};

struct DayBucket {
    sender_name: String,
    texts: Vec<String>,
    first_timestamp: chrono::DateTime<chrono::Utc>,
}

/// Parses an IANA timezone name. All calendar-day bucketing in the process
/// uses one fixed zone so a restart never re-slices days differently.
pub fn parse_timezone(raw: &str) -> Result<Tz> {
    raw.parse()
        .ok()
        .with_context(|| format!("invalid timezone '{raw}'"))
}

/// Folds messages into one record per (calendar day, sender).
///
/// Messages are bucketed by the calendar date of their timestamp in
/// `timezone`, then by raw sender id; within a bucket texts are joined with
/// newlines in arrival order and the earliest timestamp wins. The sender id
/// is anonymized as the last step; grouping must see the raw id so one
/// person's split messages land in one bucket no matter how the token is
/// derived.
pub fn aggregate_daily(
    anonymizer: &SenderAnonymizer,
    timezone: Tz,
    messages: &[NormalizedMessage],
) -> Vec<AggregatedRecord> {
    let mut buckets: BTreeMap<(NaiveDate, String), DayBucket> = BTreeMap::new();
    for message in messages {
        let day = message.timestamp.with_timezone(&timezone).date_naive();
        let key = (day, message.sender_id.clone());
        let bucket = buckets.entry(key).or_insert_with(|| DayBucket {
            sender_name: message.sender_name.clone(),
            texts: Vec::new(),
            first_timestamp: message.timestamp,
        });
        bucket.texts.push(message.text.clone());
        if message.timestamp < bucket.first_timestamp {
            bucket.first_timestamp = message.timestamp;
        }
        if bucket.sender_name.is_empty() && !message.sender_name.is_empty() {
            bucket.sender_name = message.sender_name.clone();
        }
    }

    buckets
        .into_iter()
        .map(|((_, raw_sender_id), bucket)| AggregatedRecord {
            timestamp: bucket.first_timestamp,
            sender_id: anonymizer.anonymize(&raw_sender_id),
            sender_name: bucket.sender_name,
            text: bucket.texts.join("\n"),
        })
        .collect()
}
