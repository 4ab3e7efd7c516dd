//! HTTP transport to the charger
//!
//! The device exposes fixed JSON POST endpoints. `Transport` is the seam
//! between the session logic and the wire so sessions can be driven by a
//! scripted transport in tests.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::api::ApiError;

/// Response of one POST
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self { status: 200, body: body.into() }
    }

    pub fn json(value: &Value) -> Self {
        Self::ok(value.to_string())
    }

    /// Fail on non-2xx statuses
    pub fn error_for_status(self, path: &str) -> Result<Self, ApiError> {
        if (200..300).contains(&self.status) {
            Ok(self)
        } else {
            Err(ApiError::Status {
                path: path.to_string(),
                status: self.status,
                body: self.body,
            })
        }
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Plain-text acknowledgement used by the write endpoints
    pub fn is_received(&self) -> bool {
        self.body == "Received"
    }
}

pub trait Transport: Send + Sync {
    /// POST `body` (or an empty body) to `path` relative to the device base URL
    fn post(&self, path: &str, body: Option<&Value>) -> Result<Reply, ApiError>;

    fn base_url(&self) -> &str;
}

/// Blocking reqwest client bound to one device
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn post(&self, path: &str, body: Option<&Value>) -> Result<Reply, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, body = ?body, "POST");

        let request = self.client.post(&url);
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };

        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;

        Ok(Reply { status, body })
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_is_normalized() {
        let transport = HttpTransport::new("http://10.0.0.5/", Duration::from_secs(1)).unwrap();
        assert_eq!(transport.base_url(), "http://10.0.0.5");
    }

    #[test]
    fn test_reply_status_and_ack() {
        assert!(Reply::ok("Received").is_received());
        assert!(!Reply::ok("Received\n").is_received());

        let err = Reply { status: 500, body: "oops".into() }
            .error_for_status("/api/get_cells_info")
            .unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, .. }));

        let reply = Reply::json(&json!({"McC": "Firmware V4.3.0.11"}));
        let parsed: Value = reply.parse().unwrap();
        assert_eq!(parsed["McC"], "Firmware V4.3.0.11");
    }
}
