//! Stateful-session strategy: drives a shared rendering session per batch.

use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

use super::{FetchFailure, FetchStrategy, normalize_text, tracking_url};
use crate::models::TrackingEvent;

/// Present once the carrier page reports the parcel as handed over.
pub const DELIVERED_MARKER_XPATH: &str =
    "//*[self::h1 or self::h2 or self::h3 or self::span][normalize-space(.)='Delivered']";
/// One entry of the live tracking timeline, newest first.
pub const TIMELINE_ENTRY_XPATH: &str =
    "//div[contains(@class,'pl-6') and contains(@class,'cursor-pointer')]";

const COURIER_NAME: &str = "Delhivery";
const LOCATION_PLACEHOLDER: &str = "Check Link";
const DESCRIPTION_PLACEHOLDER: &str = "Status update available";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start rendering session: {0}")]
    Start(String),

    #[error("webdriver command failed: {0}")]
    Command(String),
}

/// Opaque handle to an element inside a rendering session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle(pub String);

/// A live browser session.
#[async_trait]
pub trait RenderSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    async fn find_elements(&self, xpath: &str) -> Result<Vec<ElementHandle>, SessionError>;

    /// Text of the first `tag` descendant of `parent`, `None` if there is none.
    async fn child_text(
        &self,
        parent: &ElementHandle,
        tag: &str,
    ) -> Result<Option<String>, SessionError>;

    async fn close(&self);
}

/// Acquires and releases rendering sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn RenderSession>, SessionError>;

    async fn release(&self, session: Box<dyn RenderSession>) {
        session.close().await;
    }
}

/// Which of the two readiness markers showed up first.
enum PageState {
    Delivered,
    Timeline(ElementHandle),
}

pub struct SessionStrategy<'s> {
    session: &'s dyn RenderSession,
    url_template: String,
    timeout: Duration,
}

impl<'s> SessionStrategy<'s> {
    pub fn new(session: &'s dyn RenderSession, url_template: String, timeout: Duration) -> Self {
        Self {
            session,
            url_template,
            timeout,
        }
    }

    async fn wait_for_page(&self) -> Result<PageState, FetchFailure> {
        let deadline = Instant::now() + self.timeout;

        loop {
            if !self.find(DELIVERED_MARKER_XPATH).await?.is_empty() {
                return Ok(PageState::Delivered);
            }

            if let Some(entry) = self.find(TIMELINE_ENTRY_XPATH).await?.into_iter().next() {
                return Ok(PageState::Timeline(entry));
            }

            if Instant::now() >= deadline {
                return Err(FetchFailure::Timeout(self.timeout));
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    async fn find(&self, xpath: &str) -> Result<Vec<ElementHandle>, FetchFailure> {
        self.session
            .find_elements(xpath)
            .await
            .map_err(|e| FetchFailure::Session(e.to_string()))
    }

    async fn read_timeline_entry(&self, entry: &ElementHandle) -> Result<String, FetchFailure> {
        let status = self
            .session
            .child_text(entry, "h3")
            .await
            .map_err(|e| FetchFailure::Session(e.to_string()))?
            .map(|text| normalize_text(&text))
            .filter(|text| !text.is_empty())
            .ok_or_else(|| FetchFailure::MissingElement("timeline status heading".to_string()))?;

        let description = match self.session.child_text(entry, "p").await {
            Ok(Some(text)) if !text.trim().is_empty() => normalize_text(&text),
            _ => DESCRIPTION_PLACEHOLDER.to_string(),
        };

        Ok(format!("{status}: {description}"))
    }
}

#[async_trait]
impl FetchStrategy for SessionStrategy<'_> {
    async fn fetch(&self, waybill: &str) -> Result<TrackingEvent, FetchFailure> {
        let url = tracking_url(&self.url_template, waybill);

        self.session
            .navigate(&url)
            .await
            .map_err(|e| FetchFailure::Session(e.to_string()))?;

        let details = match self.wait_for_page().await? {
            PageState::Delivered => {
                debug!(waybill, "delivered marker present");
                "Delivered".to_string()
            }
            PageState::Timeline(entry) => self.read_timeline_entry(&entry).await?,
        };

        let now = Local::now();
        Ok(TrackingEvent {
            courier_name: COURIER_NAME.to_string(),
            location: LOCATION_PLACEHOLDER.to_string(),
            details,
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M").to_string(),
            link: url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted page: markers appear after a number of polls.
    #[derive(Default)]
    struct FakePage {
        delivered_after: Option<usize>,
        timeline_after: Option<usize>,
        texts: HashMap<String, String>,
        polls: Mutex<usize>,
        visited: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RenderSession for FakePage {
        async fn navigate(&self, url: &str) -> Result<(), SessionError> {
            self.visited.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn find_elements(&self, xpath: &str) -> Result<Vec<ElementHandle>, SessionError> {
            let mut polls = self.polls.lock().unwrap();
            let seen = *polls;
            if xpath == TIMELINE_ENTRY_XPATH {
                *polls += 1;
            }
            let ready = |after: Option<usize>| after.is_some_and(|n| seen >= n);
            if xpath == DELIVERED_MARKER_XPATH && ready(self.delivered_after) {
                return Ok(vec![ElementHandle("delivered".into())]);
            }
            if xpath == TIMELINE_ENTRY_XPATH && ready(self.timeline_after) {
                return Ok(vec![ElementHandle("first".into()), ElementHandle("second".into())]);
            }
            Ok(Vec::new())
        }

        async fn child_text(
            &self,
            parent: &ElementHandle,
            tag: &str,
        ) -> Result<Option<String>, SessionError> {
            Ok(self.texts.get(&format!("{}/{}", parent.0, tag)).cloned())
        }

        async fn close(&self) {}
    }

    fn strategy(page: &FakePage) -> SessionStrategy<'_> {
        SessionStrategy::new(page, "https://carrier.test/{waybill}".to_string(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn delivered_marker_yields_canonical_event() {
        let page = FakePage {
            delivered_after: Some(0),
            ..Default::default()
        };
        let event = strategy(&page).fetch("1234567890123").await.unwrap();
        assert_eq!(event.details, "Delivered");
        assert_eq!(event.courier_name, "Delhivery");
        assert_eq!(event.link, "https://carrier.test/1234567890123");
        assert_eq!(page.visited.lock().unwrap().as_slice(), ["https://carrier.test/1234567890123"]);
    }

    #[tokio::test]
    async fn newest_timeline_entry_is_read() {
        let mut texts = HashMap::new();
        texts.insert("first/h3".to_string(), " In Transit ".to_string());
        texts.insert("first/p".to_string(), "Arrived at  Bhiwandi hub".to_string());
        texts.insert("second/h3".to_string(), "Picked Up".to_string());
        let page = FakePage {
            timeline_after: Some(1),
            texts,
            ..Default::default()
        };
        let event = strategy(&page).fetch("1234567890123").await.unwrap();
        assert_eq!(event.details, "In Transit: Arrived at Bhiwandi hub");
        assert_eq!(event.location, "Check Link");
    }

    #[tokio::test]
    async fn missing_description_uses_placeholder() {
        let mut texts = HashMap::new();
        texts.insert("first/h3".to_string(), "Out for Delivery".to_string());
        let page = FakePage {
            timeline_after: Some(0),
            texts,
            ..Default::default()
        };
        let event = strategy(&page).fetch("1234567890123").await.unwrap();
        assert_eq!(event.details, "Out for Delivery: Status update available");
    }

    #[tokio::test]
    async fn missing_status_heading_is_a_failure() {
        let page = FakePage {
            timeline_after: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            strategy(&page).fetch("1234567890123").await,
            Err(FetchFailure::MissingElement(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn no_marker_times_out() {
        let page = FakePage::default();
        assert_eq!(
            strategy(&page).fetch("1234567890123").await,
            Err(FetchFailure::Timeout(Duration::from_secs(2)))
        );
    }
}
