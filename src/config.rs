use anyhow::{Context, Result, bail};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BLUEDART_URL: &str =
    "https://www.bluedart.com/trackdartresultthirdparty?trackFor=0&trackNo={waybill}";
pub const DEFAULT_DELHIVERY_URL: &str = "https://www.delhivery.com/track-v2/package/{waybill}";

/// Upper bound for `MAX_RETRIES`.
const RETRY_LIMIT: u32 = 20;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub imap_server: String,
    pub imap_port: u16,
    pub email_address: String,
    pub email_password: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub recipient_email: Option<String>,
    pub db_file: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub session_timeout: Duration,
    pub chromedriver_path: String,
    pub webdriver_port: u16,
    pub webdriver_url: Option<String>,
    pub bluedart_url_template: String,
    pub delhivery_url_template: String,
    pub cron_schedule: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Environment Variables
    /// - `IMAP_SERVER`: Required - mailbox harvested for waybills
    /// - `IMAP_PORT`: Optional - implicit TLS port (default: 993)
    /// - `EMAIL_ADDRESS`: Required - login for IMAP and SMTP, also the sender address
    /// - `EMAIL_PASSWORD`: Required - password for IMAP and SMTP
    /// - `SMTP_SERVER`: Required - outbound server for notifications
    /// - `SMTP_PORT`: Optional - 465 for implicit TLS, otherwise STARTTLS (default: 587)
    /// - `RECIPIENT_EMAIL`: Optional - route every notification to this address
    /// - `DB_FILE`: Optional - SQLite ledger path (default: "waybill_tracker.db")
    /// - `REQUEST_TIMEOUT_SECS`: Optional - per-request HTTP timeout (default: 15)
    /// - `MAX_RETRIES`: Optional - transient HTTP retries, at most 20 (default: 3)
    /// - `RETRY_DELAY_SECS`: Optional - initial backoff interval (default: 5)
    /// - `SESSION_TIMEOUT_SECS`: Optional - page readiness wait (default: 20)
    /// - `CHROMEDRIVER_PATH`: Optional - chromedriver binary (default: "/usr/bin/chromedriver")
    /// - `WEBDRIVER_PORT`: Optional - port for the spawned chromedriver (default: 9515)
    /// - `WEBDRIVER_URL`: Optional - use an already running WebDriver endpoint
    /// - `BLUEDART_URL_TEMPLATE`, `DELHIVERY_URL_TEMPLATE`: Optional - tracking URLs with `{waybill}`
    /// - `CRON_SCHEDULE`: Optional - run in-process on this cron expression instead of once
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let imap_server = required(&lookup, "IMAP_SERVER")?;
        let imap_port = parse_or(&lookup, "IMAP_PORT", 993)?;
        let email_address = required(&lookup, "EMAIL_ADDRESS")?;
        let email_password = required(&lookup, "EMAIL_PASSWORD")?;
        let smtp_server = required(&lookup, "SMTP_SERVER")?;
        let smtp_port = parse_or(&lookup, "SMTP_PORT", 587)?;

        let recipient_email = optional(&lookup, "RECIPIENT_EMAIL");
        if let Some(recipient) = &recipient_email {
            if !recipient.contains('@') {
                bail!("RECIPIENT_EMAIL is not an email address: {}", recipient);
            }
        }

        let db_file = optional(&lookup, "DB_FILE").unwrap_or_else(|| "waybill_tracker.db".to_string());

        let request_timeout = Duration::from_secs(parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 15)?);
        let max_retries = parse_or(&lookup, "MAX_RETRIES", 3)?;
        if max_retries > RETRY_LIMIT {
            bail!("MAX_RETRIES must be at most {}, got {}", RETRY_LIMIT, max_retries);
        }
        let retry_delay = Duration::from_secs(parse_or(&lookup, "RETRY_DELAY_SECS", 5)?);
        let session_timeout = Duration::from_secs(parse_or(&lookup, "SESSION_TIMEOUT_SECS", 20)?);

        if request_timeout.is_zero() || session_timeout.is_zero() {
            bail!("timeouts must be greater than zero");
        }

        let chromedriver_path = optional(&lookup, "CHROMEDRIVER_PATH")
            .unwrap_or_else(|| "/usr/bin/chromedriver".to_string());
        let webdriver_port = parse_or(&lookup, "WEBDRIVER_PORT", 9515)?;
        let webdriver_url = optional(&lookup, "WEBDRIVER_URL");

        let bluedart_url_template = url_template(&lookup, "BLUEDART_URL_TEMPLATE", DEFAULT_BLUEDART_URL)?;
        let delhivery_url_template = url_template(&lookup, "DELHIVERY_URL_TEMPLATE", DEFAULT_DELHIVERY_URL)?;

        let cron_schedule = optional(&lookup, "CRON_SCHEDULE");

        Ok(Config {
            imap_server,
            imap_port,
            email_address,
            email_password,
            smtp_server,
            smtp_port,
            recipient_email,
            db_file,
            request_timeout,
            max_retries,
            retry_delay,
            session_timeout,
            chromedriver_path,
            webdriver_port,
            webdriver_url,
            bluedart_url_template,
            delhivery_url_template,
            cron_schedule,
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).with_context(|| format!("{} not set", key))?;

    if value.trim().is_empty() {
        bail!("{} cannot be empty", key);
    }

    Ok(value.trim().to_string())
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn url_template<F>(lookup: &F, key: &str, default: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let template = optional(lookup, key).unwrap_or_else(|| default.to_string());

    if !template.contains("{waybill}") {
        bail!("{} must contain a {{waybill}} placeholder", key);
    }

    Ok(template)
}
