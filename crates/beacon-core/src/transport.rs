use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::TransportError;
use crate::request::OutgoingRequest;

/// Successful exchange with the collector.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Option<Value>,
}

/// Performs the network exchange for one request.
///
/// Implementations decide GET vs POST, apply interceptors and tamper
/// protection, and must only return `Ok` when the collector accepted the
/// request (2xx with a JSON `result` field).
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &OutgoingRequest) -> Result<TransportResponse, TransportError>;
}

/// Notified around every attempted send. Used for auditing and tests.
pub trait RequestObserver: Send + Sync {
    fn on_request(&self, serialized: &str);

    fn on_response(&self, status: Option<u16>, body: Option<&Value>, error: Option<&str>);
}

/// Device metrics attached to session begins and crash reports.
pub trait MetricProvider: Send + Sync {
    /// `_os`, `_os_version`, `_device`, `_app_version`, ...
    fn metrics(&self) -> BTreeMap<String, String>;

    /// Extra fields for crash reports (`_ram_current`, `_online`, ...).
    fn crash_metrics(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Fixed metric values, for hosts that collect metrics elsewhere.
#[derive(Clone, Debug, Default)]
pub struct StaticMetrics {
    pub values: BTreeMap<String, String>,
}

impl StaticMetrics {
    pub fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { values: values.into_iter().collect() }
    }

    /// Host OS and architecture as reported by the standard library.
    pub fn host() -> Self {
        Self::new([
            ("_os".to_owned(), std::env::consts::OS.to_owned()),
            ("_device".to_owned(), std::env::consts::ARCH.to_owned()),
        ])
    }
}

impl MetricProvider for StaticMetrics {
    fn metrics(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_metrics_returns_values() {
        let m = StaticMetrics::new([("_os".to_string(), "linux".to_string())]);
        assert_eq!(m.metrics().get("_os").map(String::as_str), Some("linux"));
        assert!(m.crash_metrics().is_empty());
    }

    #[test]
    fn host_metrics_include_os() {
        assert!(StaticMetrics::host().metrics().contains_key("_os"));
    }
}
