//! Read-only HTTP(S) handler

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, Response, header};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use super::{ByteReader, ProtocolError, ProtocolHandler, Result};

/// HTTP client configuration.
///
/// Only the connect phase is bounded; a body may take as long as it takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            user_agent: concat!("mediaferry/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    /// Shared client; handlers clone it cheaply
    pub fn build_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(&self.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| ProtocolError::transport("http", e))
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub struct HttpHandler {
    client: Client,
    config: HttpConfig,
    target: Option<Url>,
}

impl HttpHandler {
    pub fn new(client: Client, config: HttpConfig) -> Self {
        Self {
            client,
            config,
            target: None,
        }
    }

    fn target(&self) -> Result<&Url> {
        self.target.as_ref().ok_or(ProtocolError::NotInitialized)
    }

    /// GET with retry and exponential backoff (1s, 2s, 4s, ...)
    async fn get_with_retry(&self, url: &Url) -> Result<Response> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.get_once(url).await {
                Ok(response) => {
                    if attempts > 1 {
                        debug!(%url, attempts, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if attempts >= self.config.max_retries.max(1) {
                        warn!(%url, attempts, error = %e, "Request failed after retries");
                        return Err(ProtocolError::transport(
                            url.as_str(),
                            format!("failed after {} attempts: {}", attempts, e),
                        ));
                    }

                    warn!(%url, attempts, error = %e, "Request failed, retrying");
                    let backoff = Duration::from_secs(2u64.pow(attempts - 1));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn get_once(&self, url: &Url) -> std::result::Result<Response, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        check_status(response)
    }
}

fn check_status(response: Response) -> std::result::Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        ))
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn scheme(&self) -> &'static str {
        "http"
    }

    async fn init(&mut self, uri: &Url) -> Result<()> {
        match uri.scheme() {
            "http" | "https" if uri.host_str().is_some() => {
                self.target = Some(uri.clone());
                Ok(())
            }
            "http" | "https" => Err(ProtocolError::invalid_uri(uri.as_str(), "missing host")),
            other => Err(ProtocolError::UnsupportedScheme(other.to_string())),
        }
    }

    async fn open_stream(&mut self) -> Result<ByteReader> {
        let url = self.target()?.clone();
        let response = self.get_with_retry(&url).await?;
        debug!(%url, length = ?response.content_length(), "Streaming HTTP body");

        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn content_length(&mut self) -> Result<u64> {
        let url = self.target()?.clone();
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| ProtocolError::transport(url.as_str(), e))?;
        let response =
            check_status(response).map_err(|e| ProtocolError::transport(url.as_str(), e))?;

        // HEAD responses carry no body, so read the header rather than the body hint
        response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| ProtocolError::transport(url.as_str(), "no Content-Length header"))
    }
}
