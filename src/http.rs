//! JSON-over-HTTP calls with retry and exponential backoff.
//!
//! Shared by the remote embedding and LLM clients.
//!
//! | Outcome                 | Action                       |
//! |-------------------------|------------------------------|
//! | 2xx                     | parse body as JSON, return   |
//! | 429 or 5xx              | retry after 1s, 2s, 4s, ...  |
//! | other 4xx               | fail immediately             |
//! | network / timeout error | retry                        |

use anyhow::{bail, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// A configured endpoint: client, URL, optional bearer token, retries.
pub struct JsonEndpoint {
    client: reqwest::Client,
    url: String,
    bearer: Option<String>,
    max_retries: u32,
    service: &'static str,
}

impl JsonEndpoint {
    pub fn new(
        service: &'static str,
        url: impl Into<String>,
        bearer: Option<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            bearer,
            max_retries,
            service,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST `body` and return the parsed JSON response.
    pub async fn post(&self, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(
                    "{} retry {}/{} in {:?}",
                    self.service, attempt, self.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(token) = &self.bearer {
                request = request.header("Authorization", format!("Bearer {}", token));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "{} API error {}: {}",
                            self.service,
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("{} API error {}: {}", self.service, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "{} request to {} failed: {}",
                        self.service,
                        self.url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed after retries", self.service)))
    }
}

/// `OPENAI_API_KEY` from the environment.
pub fn openai_api_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))
}

/// Default base URL of a local Ollama instance.
pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// `base` without trailing slashes, joined with `path`.
pub fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_trims_slashes() {
        assert_eq!(
            endpoint_url("http://localhost:11434/", "/api/embed"),
            "http://localhost:11434/api/embed"
        );
        assert_eq!(endpoint_url("http://h", "/x"), "http://h/x");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_without_retries() {
        let endpoint = JsonEndpoint::new(
            "Test",
            "http://127.0.0.1:1/none",
            None,
            Duration::from_millis(200),
            0,
        )
        .unwrap();
        let err = endpoint.post(&serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Test request"));
    }
}
