//! Configuration for charger sessions and workflow runs

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;

/// Environment variable holding the device base URL
pub const ENV_BASEURL: &str = "MCC_BASEURL";
/// Environment variable holding the multi-charger URLs file
pub const ENV_URLS_FILE: &str = "MCC_URLS_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read charger urls file: {0}")]
    Io(#[from] std::io::Error),

    #[error("charger urls file is not a JSON object of strings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("charger {0:?} not found in urls file")]
    UnknownSelector(String),

    #[error("no charger base URL: use --mcc-baseurl, MCC_BASEURL or a charger selector with a urls file")]
    MissingBaseUrl,
}

/// Settings for one device session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device base URL, e.g. `http://192.168.4.1`
    pub base_url: String,

    /// Applied to every request
    pub retry: RetryPolicy,

    /// Sent with `/api/get_cells_info`; static on current firmware
    pub charger_id: u32,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            retry: RetryPolicy::default(),
            charger_id: 1,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_charger_id(mut self, charger_id: u32) -> Self {
        self.charger_id = charger_id;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Settings for one orchestrator run
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Charger selector, recorded in the workflow log and shown in prompts
    pub selector: Option<String>,

    /// Create cell records that are not found
    pub autocreate: bool,

    /// Container path for created cells
    pub path: String,

    /// Pause between two polls of the device
    pub poll_interval: Duration,

    /// Give up on a running action after this long; `None` waits forever
    pub wait_timeout: Option<Duration>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            selector: None,
            autocreate: false,
            path: "/".to_string(),
            poll_interval: Duration::from_secs(5),
            wait_timeout: None,
        }
    }
}

impl WorkflowConfig {
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_autocreate(mut self, autocreate: bool) -> Self {
        self.autocreate = autocreate;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

/// Selector → base URL map for sites running several chargers.
///
/// The file is a flat JSON object: `{"left": "http://10.0.0.5", "right": "http://10.0.0.6"}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChargerUrls(BTreeMap<String, String>);

impl ChargerUrls {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(Self(serde_json::from_str(text)?))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn resolve(&self, selector: &str) -> Result<&str, ConfigError> {
        self.0
            .get(selector)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::UnknownSelector(selector.to_string()))
    }
}

/// Pick the device base URL: an explicit URL wins over a selector lookup
pub fn resolve_base_url(
    base_url: Option<&str>,
    selector: Option<&str>,
    urls_file: Option<&Path>,
) -> Result<String, ConfigError> {
    if let Some(url) = base_url {
        return Ok(url.to_string());
    }

    match (selector, urls_file) {
        (Some(selector), Some(file)) => Ok(ChargerUrls::load(file)?.resolve(selector)?.to_string()),
        _ => Err(ConfigError::MissingBaseUrl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::new("http://10.0.0.5");
        assert_eq!(config.retry.max_retries, 20);
        assert_eq!(config.retry.delay, Duration::from_secs(10));
        assert_eq!(config.charger_id, 1);
    }

    #[test]
    fn test_workflow_config_builder() {
        let config = WorkflowConfig::default()
            .with_selector("left")
            .with_autocreate(true)
            .with_path("/incoming")
            .with_poll_interval(Duration::from_millis(10));

        assert_eq!(config.selector.as_deref(), Some("left"));
        assert!(config.autocreate);
        assert_eq!(config.path, "/incoming");
        assert_eq!(config.wait_timeout, None);
    }

    #[test]
    fn test_urls_file_lookup() {
        let urls = ChargerUrls::parse(r#"{"left": "http://10.0.0.5", "right": "http://10.0.0.6"}"#).unwrap();
        assert_eq!(urls.resolve("right").unwrap(), "http://10.0.0.6");
        assert!(matches!(urls.resolve("middle"), Err(ConfigError::UnknownSelector(_))));
        assert!(ChargerUrls::parse(r#"["http://10.0.0.5"]"#).is_err());
    }

    #[test]
    fn test_resolve_base_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"left": "http://10.0.0.5"}}"#).unwrap();

        assert_eq!(
            resolve_base_url(Some("http://direct"), Some("left"), Some(file.path())).unwrap(),
            "http://direct"
        );
        assert_eq!(
            resolve_base_url(None, Some("left"), Some(file.path())).unwrap(),
            "http://10.0.0.5"
        );
        assert!(matches!(resolve_base_url(None, Some("left"), None), Err(ConfigError::MissingBaseUrl)));
    }
}
