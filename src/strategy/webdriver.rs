//! W3C WebDriver client backing the rendering session with headless Chrome.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::session::{ElementHandle, RenderSession, SessionError, SessionProvider};
use crate::config::Config;

/// Key of the element reference object in W3C WebDriver responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const CHROME_ARGS: &[&str] = &[
    "--headless=new",
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--window-size=1920,1080",
    "--log-level=3",
];

/// Starts chromedriver (unless an endpoint is configured) and opens headless Chrome sessions.
pub struct ChromeDriverProvider {
    http_client: HttpClient,
    chromedriver_path: String,
    port: u16,
    endpoint: Option<String>,
    command_timeout: Duration,
}

impl ChromeDriverProvider {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http_client: HttpClient::new(),
            chromedriver_path: config.chromedriver_path.clone(),
            port: config.webdriver_port,
            endpoint: config.webdriver_url.clone(),
            command_timeout: config.session_timeout + config.request_timeout,
        }
    }

    fn spawn_driver(&self) -> Result<Child, SessionError> {
        Command::new(&self.chromedriver_path)
            .arg(format!("--port={}", self.port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Start(format!("{}: {}", self.chromedriver_path, e)))
    }

    async fn wait_until_ready(&self, base_url: &str) -> Result<(), SessionError> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        let status_url = format!("{base_url}/status");

        loop {
            if let Ok(response) = self.http_client.get(&status_url).send().await {
                if let Ok(body) = response.json::<Value>().await {
                    if body["value"]["ready"].as_bool() == Some(true) {
                        return Ok(());
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(SessionError::Start(format!(
                    "webdriver at {base_url} not ready after {STARTUP_TIMEOUT:?}"
                )));
            }

            sleep(Duration::from_millis(200)).await;
        }
    }
}

#[async_trait]
impl SessionProvider for ChromeDriverProvider {
    async fn acquire(&self) -> Result<Box<dyn RenderSession>, SessionError> {
        let (base_url, driver) = match &self.endpoint {
            Some(endpoint) => (endpoint.trim_end_matches('/').to_string(), None),
            None => (format!("http://127.0.0.1:{}", self.port), Some(self.spawn_driver()?)),
        };

        self.wait_until_ready(&base_url).await?;

        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": CHROME_ARGS }
                }
            }
        });

        let response = self
            .http_client
            .post(format!("{base_url}/session"))
            .json(&capabilities)
            .send()
            .await
            .map_err(|e| SessionError::Start(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| SessionError::Start(e.to_string()))?;

        let session_id = body["value"]["sessionId"]
            .as_str()
            .ok_or_else(|| SessionError::Start(format!("no session id in response: {body}")))?
            .to_string();

        info!(session_id = %session_id, "rendering session started");

        Ok(Box::new(WebDriverSession {
            http_client: self.http_client.clone(),
            session_url: format!("{base_url}/session/{session_id}"),
            command_timeout: self.command_timeout,
            driver: Mutex::new(driver),
        }))
    }
}

/// One WebDriver session; the chromedriver child (if any) dies with it.
pub struct WebDriverSession {
    http_client: HttpClient,
    session_url: String,
    command_timeout: Duration,
    driver: Mutex<Option<Child>>,
}

impl WebDriverSession {
    async fn command(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value, SessionError> {
        let url = format!("{}{}", self.session_url, path);
        let mut request = self
            .http_client
            .request(method, &url)
            .timeout(self.command_timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SessionError::Command(e.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| SessionError::Command(e.to_string()))?;

        if !status.is_success() {
            let error = payload["value"]["error"].as_str().unwrap_or("unknown error");
            return Err(SessionError::Command(format!("{path}: {error} (status {status})")));
        }

        Ok(payload["value"].clone())
    }
}

fn element_handles(value: &Value) -> Vec<ElementHandle> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item[ELEMENT_KEY].as_str())
                .map(|id| ElementHandle(id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl RenderSession for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.command(reqwest::Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn find_elements(&self, xpath: &str) -> Result<Vec<ElementHandle>, SessionError> {
        let value = self
            .command(
                reqwest::Method::POST,
                "/elements",
                Some(json!({ "using": "xpath", "value": xpath })),
            )
            .await?;
        Ok(element_handles(&value))
    }

    async fn child_text(
        &self,
        parent: &ElementHandle,
        tag: &str,
    ) -> Result<Option<String>, SessionError> {
        let children = self
            .command(
                reqwest::Method::POST,
                &format!("/element/{}/elements", parent.0),
                Some(json!({ "using": "tag name", "value": tag })),
            )
            .await?;

        let Some(child) = element_handles(&children).into_iter().next() else {
            return Ok(None);
        };

        let text = self
            .command(reqwest::Method::GET, &format!("/element/{}/text", child.0), None)
            .await?;
        Ok(text.as_str().map(str::to_string))
    }

    async fn close(&self) {
        if let Err(e) = self.command(reqwest::Method::DELETE, "", None).await {
            warn!(error = %e, "failed to delete webdriver session");
        }

        if let Some(mut driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.kill().await {
                warn!(error = %e, "failed to stop chromedriver");
            }
        }

        debug!("rendering session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_handles_are_extracted() {
        let value = json!([
            { ELEMENT_KEY: "a-1" },
            { "unexpected": "x" },
            { ELEMENT_KEY: "b-2" }
        ]);
        assert_eq!(
            element_handles(&value),
            vec![ElementHandle("a-1".into()), ElementHandle("b-2".into())]
        );
        assert!(element_handles(&json!(null)).is_empty());
    }
}
