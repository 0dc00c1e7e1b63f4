use sha2::{Digest, Sha256};

use crate::models::TrackingEvent;

/// Hex SHA-256 over the status-defining fields of an event.
///
/// `date` and `time` are left out: carriers stamp them on every poll.
pub fn fingerprint(event: &TrackingEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.details.trim().as_bytes());
    hasher.update([0x1f]);
    hasher.update(event.location.trim().as_bytes());
    hex::encode(hasher.finalize())
}
