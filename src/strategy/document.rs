//! Stateless-document strategy: one HTTP GET per waybill, HTML parsed in place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};

use super::{FetchFailure, FetchStrategy, normalize_text, tracking_url};
use crate::config::Config;
use crate::models::TrackingEvent;

#[allow(clippy::expect_used)] // literal selectors are always valid
static ID_DIVS: Lazy<Selector> = Lazy::new(|| Selector::parse("div[id]").expect("valid selector"));
#[allow(clippy::expect_used)]
static BODY_ROWS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table tbody tr").expect("valid selector"));
#[allow(clippy::expect_used)]
static CELLS: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("valid selector"));

const COURIER_NAME: &str = "Blue Dart";
const USER_AGENT: &str = "Mozilla/5.0";

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

pub struct DocumentStrategy {
    http_client: Client,
    url_template: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl DocumentStrategy {
    pub fn new(url_template: String, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            url_template,
            timeout,
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.bluedart_url_template.clone(),
            config.request_timeout,
            RetryPolicy {
                max_retries: config.max_retries,
                initial_delay: config.retry_delay,
            },
        )
    }

    async fn fetch_document(&self, url: &str) -> Result<String, FetchFailure> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.1)
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = self.retry.max_retries.saturating_add(1);
        let mut attempts = 0u32;

        retry(policy, || {
            attempts += 1;
            let attempt = attempts;
            let client = &self.http_client;
            let timeout = self.timeout;

            async move {
                let outcome = match client.get(url).send().await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            response.text().await.map_err(|e| {
                                backoff::Error::transient(FetchFailure::Transport(e.to_string()))
                            })
                        } else if is_transient_status(status) {
                            Err(backoff::Error::transient(FetchFailure::Status(status.as_u16())))
                        } else {
                            Err(backoff::Error::permanent(FetchFailure::Status(status.as_u16())))
                        }
                    }
                    Err(e) if e.is_timeout() => {
                        Err(backoff::Error::transient(FetchFailure::Timeout(timeout)))
                    }
                    Err(e) => Err(backoff::Error::transient(FetchFailure::Transport(e.to_string()))),
                };

                match outcome {
                    Err(backoff::Error::Transient { err, .. }) if attempt >= max_attempts => {
                        Err(backoff::Error::permanent(err))
                    }
                    Err(backoff::Error::Transient { err, retry_after }) => {
                        warn!(url, attempt, error = %err, "transient carrier error, retrying");
                        Err(backoff::Error::Transient { err, retry_after })
                    }
                    other => other,
                }
            }
        })
        .await
    }
}

#[async_trait]
impl FetchStrategy for DocumentStrategy {
    async fn fetch(&self, waybill: &str) -> Result<TrackingEvent, FetchFailure> {
        let url = tracking_url(&self.url_template, waybill);
        let body = self.fetch_document(&url).await?;
        debug!(waybill, bytes = body.len(), "tracking document received");
        parse_tracking_document(&body, waybill, &url)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Extracts the newest scan row from the `SCAN{waybill}` container.
pub fn parse_tracking_document(
    html: &str,
    waybill: &str,
    link: &str,
) -> Result<TrackingEvent, FetchFailure> {
    let document = Html::parse_document(html);
    let container_id = format!("SCAN{waybill}");

    let container = document
        .select(&ID_DIVS)
        .find(|div| div.value().id() == Some(container_id.as_str()))
        .ok_or_else(|| FetchFailure::MissingElement(format!("div#{container_id}")))?;

    let row = container
        .select(&BODY_ROWS)
        .next()
        .ok_or_else(|| FetchFailure::Parse("scan table has no rows".to_string()))?;

    let cells: Vec<String> = row
        .select(&CELLS)
        .map(|cell| normalize_text(&cell.text().collect::<String>()))
        .collect();

    if cells.len() < 4 {
        return Err(FetchFailure::Parse(format!(
            "expected 4 scan columns, found {}",
            cells.len()
        )));
    }

    Ok(TrackingEvent {
        courier_name: COURIER_NAME.to_string(),
        location: cells[0].clone(),
        details: cells[1].clone(),
        date: cells[2].clone(),
        time: cells[3].clone(),
        link: link.to_string(),
    })
}
