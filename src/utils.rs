use sha2::{Digest, Sha256};
use std::error::Error;

/// Content-derived identity of an inbound message: hex SHA-256 of `topic:body`.
///
/// Byte-identical redeliveries map to the same key, which is what readings,
/// outbox rows and dead-letter rows deduplicate on.
pub fn idempotency_key(topic: &str, raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(b":");
    hasher.update(raw);
    hex::encode(hasher.finalize())
}

/// Render an error with its `source()` chain, outermost first.
pub fn error_chain(err: &dyn Error) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cur = e.source();
    }
    out
}
