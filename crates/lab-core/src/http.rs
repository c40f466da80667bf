//! HTTP transport for instruments with an embedded web server.
//!
//! Some devices (network power switches, IP relays) are controlled by GET
//! requests against CGI endpoints and answer with small text or HTML
//! bodies. [`HttpTransport`] issues those requests with optional basic
//! auth and maps failures into [`LabError`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{LabError, Result};
use crate::limits::DEFAULT_TIMEOUT;

/// Basic-auth credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    name: String,
}

impl HttpTransport {
    /// `base_url` is e.g. `http://192.168.0.100`; request paths are joined
    /// to it with a single `/`.
    pub fn new(base_url: &str, name: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, name, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, name: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(LabError::Configuration(format!(
                "{base_url:?} is not an http(s) URL"
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            credentials: None,
            name: name.into(),
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` and return the body text.
    #[instrument(level = "debug", skip(self), fields(device = %self.name), err)]
    pub async fn get(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        let mut request = self.client.get(&url);
        if let Some(c) = &self.credentials {
            request = request.basic_auth(&c.username, Some(&c.password));
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LabError::Timeout {
                    device: self.name.clone(),
                    command: url.clone(),
                }
            } else {
                LabError::Http(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LabError::instrument(
                &self.name,
                format!("HTTP {status} for {url}"),
            ));
        }
        let body = response.text().await?;
        tracing::trace!(device = %self.name, url = %url, body = %body, "http reply");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joining() {
        let t = HttpTransport::new("http://10.0.0.9/", "ipp").unwrap();
        assert_eq!(
            t.url("/set.cmd?cmd=getpower"),
            "http://10.0.0.9/set.cmd?cmd=getpower"
        );
        assert_eq!(t.url("set.cmd"), "http://10.0.0.9/set.cmd");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpTransport::new("10.0.0.9", "ipp").is_err());
    }

    #[tokio::test]
    async fn unreachable_host_is_an_error() {
        let t = HttpTransport::with_timeout("http://127.0.0.1:9", "ipp", Duration::from_millis(200))
            .unwrap();
        assert!(t.get("set.cmd").await.is_err());
    }
}
