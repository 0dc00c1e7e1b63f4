//! Waybill harvesting from free text.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::mail::MailError;
use crate::models::{CourierKind, IngestedWaybill};

/// Producer of newly seen waybills (normally the mailbox).
#[async_trait]
pub trait WaybillSource: Send + Sync {
    /// Drains everything new since the previous call.
    async fn drain(&self) -> Result<Vec<IngestedWaybill>, MailError>;
}

/// Finds carrier waybills in `text`.
///
/// A waybill is a whole word made only of ASCII digits: 11 digits for Blue
/// Dart, 12 to 14 for Delhivery. Digits glued to letters or underscores are
/// part of a larger token and ignored. Results keep first-seen order without
/// duplicates.
pub fn extract_waybills(text: &str) -> Vec<(String, CourierKind)> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if word.is_empty() || !word.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Some(courier) = CourierKind::from_waybill_len(word.len()) else {
            continue;
        };
        if seen.insert(word) {
            found.push((word.to_string(), courier));
        }
    }

    found
}

/// Drops repeated waybills from a batch, keeping the first occurrence.
pub fn dedupe_batch(batch: Vec<IngestedWaybill>) -> Vec<IngestedWaybill> {
    let mut seen = HashSet::new();
    batch
        .into_iter()
        .filter(|item| seen.insert(item.waybill.clone()))
        .collect()
}
