//! Daily chat-message aggregation and reliable delivery pipeline.
//!
//! Normalizes raw group-chat events, folds them into one record per sender
//! per calendar day, and forwards batches to a deduplicating storage backend
//! through an at-least-once retry backlog.
//!
//! ```rust
//! use monsoon_collector::{aggregate_daily, NormalizedMessage, SenderAnonymizer};
//! use chrono::{TimeZone, Utc};
//!
//! let anonymizer = SenderAnonymizer::new("shared-secret");
//! let messages = vec![NormalizedMessage {
//!     sender_id: "farmer-1".to_string(),
//!     sender_name: "Farmer".to_string(),
//!     text: "3.90 in".to_string(),
//!     timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap(),
//!     valid: true,
//! }];
//! let records = aggregate_daily(&anonymizer, chrono_tz::Tz::UTC, &messages);
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].text, "3.90 in");
//! ```

pub mod collector_aggregate;
pub mod collector_anonymizer;
pub mod collector_contract;
pub mod collector_delivery;
pub mod collector_ingress;
pub mod collector_runtime;
pub mod collector_store;

pub use collector_aggregate::*;
pub use collector_anonymizer::*;
pub use collector_contract::*;
pub use collector_delivery::*;
pub use collector_ingress::*;
pub use collector_runtime::*;
pub use collector_store::*;
