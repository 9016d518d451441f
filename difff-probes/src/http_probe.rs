use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::debug;

/// Number of body characters kept in a probe summary.
const SUMMARY_BODY_CHARS: usize = 240;

/// Outcome of a single HTTP GET against the backend.
///
/// `ok` only says the request completed; whether the response is acceptable
/// is decided by the caller from `status`, `content_type` and `body`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub ok: bool,
    pub status: u16,
    pub content_type: String,
    /// Response body, truncated to the byte cap of the request.
    pub body: String,
    pub error: Option<String>,
}

impl ProbeResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .contains("text/html")
    }

    /// One-line summary used in diagnostics and the startup log.
    pub fn summary(&self) -> String {
        if !self.ok {
            return format!(
                "error={}",
                self.error.as_deref().unwrap_or("request-failed")
            );
        }
        let body: String = self
            .body
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(SUMMARY_BODY_CHARS)
            .collect();
        format!(
            "status={} content_type={} body={}",
            self.status, self.content_type, body
        )
    }
}

/// Thin wrapper over a reqwest client tuned for loopback probing.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Build a probe whose requests (headers and body) are bounded by
    /// `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// GET `url`, reading at most `max_bytes` of the body.
    ///
    /// Never fails: transport errors are reported through
    /// [`ProbeResult::error`].
    pub async fn fetch(&self, url: &str, max_bytes: usize) -> ProbeResult {
        let mut response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("HTTP probe for {} failed: {}", url, e);
                return ProbeResult::failed(e.to_string());
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut body = Vec::with_capacity(max_bytes.min(8192));
        while body.len() < max_bytes {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remain = max_bytes - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(remain)]);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("HTTP probe for {} failed reading body: {}", url, e);
                    return ProbeResult::failed(e.to_string());
                }
            }
        }

        ProbeResult {
            ok: true,
            status,
            content_type,
            body: String::from_utf8_lossy(&body).into_owned(),
            error: None,
        }
    }
}
