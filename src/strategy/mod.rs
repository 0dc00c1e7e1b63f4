//! Carrier fetch strategies.
//!
//! Each carrier implements [`FetchStrategy`]; the reconciler only ever sees
//! the trait. A fetch either yields the latest [`TrackingEvent`] or a
//! [`FetchFailure`] value, never a panic or an escaping error.

use async_trait::async_trait;

use crate::models::TrackingEvent;

pub mod document;
pub mod session;
pub mod webdriver;

pub use document::DocumentStrategy;
pub use session::{RenderSession, SessionError, SessionProvider, SessionStrategy};
pub use webdriver::ChromeDriverProvider;

/// Why a fetch produced no event. All variants defer the shipment to the next run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchFailure {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("carrier responded with status {0}")]
    Status(u16),

    #[error("unexpected document shape: {0}")]
    Parse(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("element not found: {0}")]
    MissingElement(String),

    #[error("rendering session error: {0}")]
    Session(String),
}

/// Capability to fetch the latest event for one waybill.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    async fn fetch(&self, waybill: &str) -> Result<TrackingEvent, FetchFailure>;
}

/// Expands a `{waybill}` URL template.
pub fn tracking_url(template: &str, waybill: &str) -> String {
    template.replace("{waybill}", waybill)
}

/// Collapses runs of whitespace, as a browser would when rendering text.
pub(crate) fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_expands_waybill() {
        assert_eq!(
            tracking_url("https://carrier.test/track/{waybill}?x=1", "1234"),
            "https://carrier.test/track/1234?x=1"
        );
    }

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(normalize_text("  In\n   transit \t hub "), "In transit hub");
    }
}
