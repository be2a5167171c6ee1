//! Keyed one-way anonymization of raw sender identifiers.
//!
//! The storage dedup key includes the anonymized id, so the transform must be
//! stable across restarts: the same `(secret, raw id)` pair always yields the
//! same token, and the raw id is not recoverable from it.

use hmac::{Hmac, Mac};
use sha2::Sha256;

#[derive(Clone)]
/// Computes opaque sender tokens as HMAC-SHA256 over the raw id, keyed by the
/// deployment's shared secret, rendered as lowercase hex.
pub struct SenderAnonymizer {
    secret: String,
}

impl SenderAnonymizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn anonymize(&self, raw_id: &str) -> String {
        // HMAC-SHA256 accepts keys of any length, so construction cannot fail.
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("hmac-sha256 accepts keys of any length");
        mac.update(raw_id.as_bytes());
        encode_hex(&mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for SenderAnonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret stays out of debug output and logs.
        f.debug_struct("SenderAnonymizer").finish_non_exhaustive()
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
