use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::debug;

use farm_common::{ActionCode, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("ESP_BASE_URL not configured")]
    NotConfigured,
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("device answered with HTTP {0}")]
    Status(u16),
    #[error("device request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReply {
    pub status: u16,
    pub body: String,
}

impl DeviceReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn into_body(self) -> Result<String, DeviceError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(DeviceError::Status(self.status))
        }
    }
}

/// HTTP client for the field controller's `/dht` and `/set` endpoints.
#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: Option<Arc<str>>,
}

impl DeviceClient {
    pub fn new(http: reqwest::Client, base_url: Option<&str>) -> Self {
        Self {
            http,
            base_url: base_url.map(Arc::from),
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn url_for(&self, path: &str) -> Result<String, DeviceError> {
        let base = self.base_url().ok_or(DeviceError::NotConfigured)?;
        Ok(format!("{base}{path}"))
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<DeviceReply, DeviceError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(err, timeout))?;
        Ok(DeviceReply { status, body })
    }

    /// One unretried read of the sensor page. Non-2xx replies are returned
    /// as-is so the proxy can relay them.
    pub async fn fetch_sensor_text(&self, timeout: Duration) -> Result<DeviceReply, DeviceError> {
        let url = self.url_for("/dht")?;
        self.get(&url, timeout).await
    }

    /// Reads the sensor page until it answers 2xx or the policy runs out.
    pub async fn read_sensors(
        &self,
        timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<String, DeviceError> {
        let mut attempt = 0;
        loop {
            let result = match self.fetch_sensor_text(timeout).await {
                Ok(reply) => reply.into_body(),
                Err(err) => Err(err),
            };
            match result {
                Ok(body) => return Ok(body),
                Err(DeviceError::NotConfigured) => return Err(DeviceError::NotConfigured),
                Err(err) if attempt + 1 >= retry.attempts => return Err(err),
                Err(err) => {
                    let delay = retry.delay_for(attempt);
                    debug!(
                        "sensor read attempt {} failed ({err}), retrying in {delay:?}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Forwards one action letter to `/set?value=X`.
    pub async fn send_value(
        &self,
        code: ActionCode,
        timeout: Duration,
    ) -> Result<DeviceReply, DeviceError> {
        let url = self.url_for(&format!("/set?value={}", code.letter()))?;
        self.get(&url, timeout).await
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> DeviceError {
    if err.is_timeout() {
        DeviceError::Timeout(timeout)
    } else {
        DeviceError::Transport(err.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use axum::{extract::Query, routing::get, Router};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// A device that accepts connections and never answers.
    pub async fn silent_device() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}")
    }

    /// A device serving a fixed `/dht` page and echoing `/set`.
    pub async fn fake_device(page: &'static str) -> String {
        let app = Router::new()
            .route("/dht", get(move || async move { page }))
            .route(
                "/set",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    format!("set {}", params.get("value").cloned().unwrap_or_default())
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}
