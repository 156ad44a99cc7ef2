//! Typed facts to request blobs.
//!
//! Every builder starts from the common parameter block (`app_key`,
//! `timestamp`, `hour`, `dow`, `tz`, `sdk_version`, `sdk_name`) and adds the
//! fact-specific parameters. Oversized keys and values are truncated, never
//! rejected; each correction is logged and counted as a health warning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::warn;

use beacon_core::{
    CrashReport, EventRecord, Feature, MetricProvider, RequestBlob, RequestKind, SegmentValue,
    Segmentation, TimeInstant, TraceRecord,
};

use crate::config::LimitsConfig;
use crate::error::Result;
use crate::health::HealthTracker;

/// Parameters a direct request may not set; the pipeline owns them.
pub const RESERVED_PARAMS: &[&str] = &[
    "app_key",
    "hour",
    "dow",
    "tz",
    "sdk_version",
    "sdk_name",
    "device_id",
    "old_device_id",
    "checksum",
    "checksum256",
    "rr",
];

pub struct RequestEncoder {
    app_key: String,
    sdk_name: String,
    sdk_version: String,
    limits: LimitsConfig,
    metrics: Arc<dyn MetricProvider>,
    health: Arc<HealthTracker>,
}

impl RequestEncoder {
    pub fn new(
        app_key: impl Into<String>,
        sdk_name: impl Into<String>,
        sdk_version: impl Into<String>,
        limits: LimitsConfig,
        metrics: Arc<dyn MetricProvider>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            sdk_name: sdk_name.into(),
            sdk_version: sdk_version.into(),
            limits,
            metrics,
            health,
        }
    }

    pub fn base_params(&self, at: TimeInstant) -> Vec<(String, String)> {
        vec![
            ("app_key".into(), self.app_key.clone()),
            ("timestamp".into(), at.timestamp.to_string()),
            ("hour".into(), at.hour.to_string()),
            ("dow".into(), at.dow.to_string()),
            ("tz".into(), at.tz_minutes.to_string()),
            ("sdk_version".into(), self.sdk_version.clone()),
            ("sdk_name".into(), self.sdk_name.clone()),
        ]
    }

    fn blob(&self, kind: RequestKind, at: TimeInstant, extra: Vec<(String, String)>) -> RequestBlob {
        let mut params = self.base_params(at);
        params.extend(extra);
        RequestBlob::new(kind, params).with_created_at(at.timestamp)
    }

    /// Left-anchored cut to `max_key_length` characters.
    pub fn truncate_key(&self, key: &str) -> String {
        self.truncate(key, self.limits.max_key_length, "key")
    }

    pub fn truncate_value(&self, value: &str) -> String {
        self.truncate(value, self.limits.max_value_size, "value")
    }

    fn truncate(&self, s: &str, limit: usize, what: &'static str) -> String {
        if s.chars().count() <= limit {
            return s.to_owned();
        }
        let cut: String = s.chars().take(limit).collect();
        warn!(what, limit, original_len = s.chars().count(), truncated = %cut, "truncating oversized {what}");
        self.health.log_warning();
        cut
    }

    /// Apply the data-shape rules to one event. `None` means the event
    /// cannot be recorded at all.
    pub fn normalize_event(&self, mut event: EventRecord) -> Option<EventRecord> {
        if event.key.is_empty() {
            warn!("dropping event with empty key");
            self.health.log_warning();
            return None;
        }
        event.key = self.truncate_key(&event.key);
        if event.count < 1 {
            warn!(key = %event.key, count = event.count, "event count below 1, using 1");
            self.health.log_warning();
            event.count = 1;
        }
        for (field, slot) in [("sum", &mut event.sum), ("dur", &mut event.dur)] {
            if matches!(slot, Some(v) if !v.is_finite()) {
                warn!(key = %event.key, field, "non-finite event {field}, using 0");
                self.health.log_warning();
                *slot = Some(0.0);
            }
        }
        event.segmentation = self.normalize_segmentation(&event.segmentation);
        Some(event)
    }

    pub fn normalize_segmentation(&self, segmentation: &Segmentation) -> Segmentation {
        let mut out = Segmentation::new();
        for (key, value) in segmentation {
            if out.len() >= self.limits.max_segmentation_values {
                warn!(
                    limit = self.limits.max_segmentation_values,
                    dropped = segmentation.len() - out.len(),
                    "too many segmentation values, dropping the rest"
                );
                self.health.log_warning();
                break;
            }
            let value = match value {
                SegmentValue::Double(d) if !d.is_finite() => {
                    warn!(key = %key, "dropping non-finite segmentation value");
                    self.health.log_warning();
                    continue;
                }
                SegmentValue::String(s) => SegmentValue::String(self.truncate_value(s)),
                other => other.clone(),
            };
            out.insert(self.truncate_key(key), value);
        }
        out
    }

    /// One blob carrying the whole batch. Each event keeps its own timestamp
    /// inside the payload.
    pub fn events_blob(&self, events: &[EventRecord], at: TimeInstant) -> Result<RequestBlob> {
        let payload = serde_json::to_string(events)?;
        Ok(self.blob(RequestKind::Events, at, vec![("events".into(), payload)]))
    }

    pub fn session_begin_blob(&self, at: TimeInstant) -> Result<RequestBlob> {
        let metrics = serde_json::to_string(&self.metrics.metrics())?;
        Ok(self.blob(
            RequestKind::Session,
            at,
            vec![("begin_session".into(), "1".into()), ("metrics".into(), metrics)],
        ))
    }

    pub fn session_update_blob(&self, at: TimeInstant, duration_secs: u64) -> RequestBlob {
        self.blob(
            RequestKind::Session,
            at,
            vec![("session_duration".into(), duration_secs.to_string())],
        )
    }

    pub fn session_end_blob(&self, at: TimeInstant, duration_secs: u64) -> RequestBlob {
        let mut extra = vec![("end_session".into(), "1".into())];
        if duration_secs > 0 {
            extra.push(("session_duration".into(), duration_secs.to_string()));
        }
        self.blob(RequestKind::Session, at, extra)
    }

    pub fn crash_blob(&self, report: &CrashReport, at: TimeInstant) -> Result<RequestBlob> {
        let mut crash = Map::new();
        for (k, v) in self.metrics.metrics().into_iter().chain(self.metrics.crash_metrics()) {
            crash.insert(k, Value::String(v));
        }
        crash.insert("_error".into(), Value::String(self.limit_stack_trace(&report.stack_trace)));
        crash.insert("_nonfatal".into(), Value::Bool(report.nonfatal));

        let skip = report
            .breadcrumbs
            .len()
            .saturating_sub(self.limits.max_breadcrumb_count);
        if skip > 0 {
            warn!(dropped = skip, "too many breadcrumbs, keeping the newest");
            self.health.log_warning();
        }
        let logs: Vec<String> = report.breadcrumbs[skip..]
            .iter()
            .map(|b| self.truncate_value(b))
            .collect();
        crash.insert("_logs".into(), Value::String(logs.join("\n")));

        let custom = self.normalize_segmentation(&report.segmentation);
        if !custom.is_empty() {
            crash.insert("_custom".into(), serde_json::to_value(custom)?);
        }
        let payload = serde_json::to_string(&Value::Object(crash))?;
        Ok(self.blob(RequestKind::Crash, at, vec![("crash".into(), payload)]))
    }

    fn limit_stack_trace(&self, trace: &str) -> String {
        let max_lines = self.limits.max_stack_trace_lines;
        let max_len = self.limits.max_stack_trace_line_length;
        let lines: Vec<&str> = trace.lines().collect();
        if lines.len() > max_lines {
            warn!(lines = lines.len(), limit = max_lines, "stack trace too long, cutting");
            self.health.log_warning();
        }
        lines
            .iter()
            .take(max_lines)
            .map(|l| l.chars().take(max_len).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn trace_blob(&self, trace: &TraceRecord, at: TimeInstant) -> Result<RequestBlob> {
        let (kind, metrics, start, end) = match trace {
            TraceRecord::Custom { start_ms, end_ms, metrics, .. } => {
                let mut m = Map::new();
                for (k, v) in metrics {
                    m.insert(self.truncate_key(k), json!(v));
                }
                m.insert("duration".into(), json!(trace.duration_ms()));
                ("device", m, *start_ms, *end_ms)
            }
            TraceRecord::Network {
                response_code,
                request_payload_bytes,
                response_payload_bytes,
                start_ms,
                end_ms,
                ..
            } => {
                let mut m = Map::new();
                m.insert("response_time".into(), json!(trace.duration_ms()));
                m.insert("response_code".into(), json!(response_code));
                m.insert("response_payload_size".into(), json!(response_payload_bytes));
                m.insert("request_payload_size".into(), json!(request_payload_bytes));
                ("network", m, *start_ms, *end_ms)
            }
            TraceRecord::AppStart { start_ms, end_ms } | TraceRecord::ScreenTime { start_ms, end_ms, .. } => {
                let mut m = Map::new();
                m.insert("duration".into(), json!(trace.duration_ms()));
                ("device", m, *start_ms, *end_ms)
            }
        };
        let apm = json!({
            "type": kind,
            "name": self.truncate_key(trace.name()),
            "apm_metrics": metrics,
            "stz": start,
            "etz": end,
        });
        Ok(self.blob(RequestKind::Trace, at, vec![("apm".into(), serde_json::to_string(&apm)?)]))
    }

    pub fn consent_blob(&self, changes: &BTreeMap<Feature, bool>, at: TimeInstant) -> Result<RequestBlob> {
        let payload: BTreeMap<&str, bool> = changes.iter().map(|(f, v)| (f.as_str(), *v)).collect();
        Ok(self.blob(
            RequestKind::Consent,
            at,
            vec![("consent".into(), serde_json::to_string(&payload)?)],
        ))
    }

    /// The `old_device_id` parameter is filled in by the identity manager,
    /// which is the only place that knows the old id at commit time.
    pub fn identity_change_blob(&self, at: TimeInstant) -> RequestBlob {
        self.blob(RequestKind::IdentityChange, at, Vec::new())
    }

    /// Caller-built parameters over the common block. Reserved keys are
    /// dropped with a warning; `None` when nothing else is left.
    pub fn direct_blob(&self, params: &[(String, String)], at: TimeInstant) -> Option<RequestBlob> {
        let mut blob = self.blob(RequestKind::Direct, at, Vec::new());
        let mut kept = 0;
        for (key, value) in params {
            if RESERVED_PARAMS.contains(&key.as_str()) {
                warn!(%key, "dropping reserved key from direct request");
                self.health.log_warning();
                continue;
            }
            blob.set_param(key, value.clone());
            kept += 1;
        }
        (kept > 0).then_some(blob)
    }

    pub fn health_blob(&self, at: TimeInstant) -> Result<RequestBlob> {
        let mut extra = vec![("hc".into(), self.health.hc_json())];
        if let Some(version) = self.metrics.metrics().get("_app_version") {
            let metrics = json!({ "_app_version": version });
            extra.push(("metrics".into(), serde_json::to_string(&metrics)?));
        }
        Ok(self.blob(RequestKind::Health, at, extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::StaticMetrics;
    use beacon_store::MemoryStorage;

    fn encoder_with(limits: LimitsConfig) -> (RequestEncoder, Arc<HealthTracker>) {
        let health = Arc::new(HealthTracker::load(Arc::new(MemoryStorage::new())));
        let metrics = StaticMetrics::new([
            ("_os".to_string(), "linux".to_string()),
            ("_app_version".to_string(), "2.1".to_string()),
        ]);
        let enc = RequestEncoder::new("app", "beacon-rust", "0.1.0", limits, Arc::new(metrics), health.clone());
        (enc, health)
    }

    fn encoder() -> (RequestEncoder, Arc<HealthTracker>) {
        encoder_with(LimitsConfig::default())
    }

    fn at() -> TimeInstant {
        TimeInstant::from_millis(1_700_000_000_000)
    }

    #[test]
    fn common_params_come_first() {
        let (enc, _) = encoder();
        let b = enc.session_update_blob(at(), 30);
        let keys: Vec<&str> = b.params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            ["app_key", "timestamp", "hour", "dow", "tz", "sdk_version", "sdk_name", "session_duration"]
        );
        assert_eq!(b.param("timestamp"), Some("1700000000000"));
        assert_eq!(b.created_at, 1_700_000_000_000);
    }

    #[test]
    fn key_over_limit_truncated_to_exact_length() {
        let (enc, health) = encoder_with(LimitsConfig { max_key_length: 8, ..Default::default() });
        assert_eq!(enc.truncate_key("abcdefghijk"), "abcdefgh");
        assert_eq!(health.snapshot().warnings, 1);
        assert_eq!(enc.truncate_key("abcdefgh"), "abcdefgh");
        assert_eq!(enc.truncate_key("abc"), "abc");
        assert_eq!(health.snapshot().warnings, 1);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let (enc, _) = encoder_with(LimitsConfig { max_key_length: 3, ..Default::default() });
        assert_eq!(enc.truncate_key("ñandú"), "ñan");
    }

    #[test]
    fn event_key_truncated_in_blob() {
        let (enc, _) = encoder_with(LimitsConfig { max_key_length: 4, ..Default::default() });
        let ev = enc
            .normalize_event(EventRecord::new("purchase", at()).with_segment("category", "books"))
            .unwrap();
        let blob = enc.events_blob(&[ev], at()).unwrap();
        let events: Value = serde_json::from_str(blob.param("events").unwrap()).unwrap();
        assert_eq!(events[0]["key"], "purc");
        assert_eq!(events[0]["segmentation"]["cate"], "books");
    }

    #[test]
    fn event_shape_corrections() {
        let (enc, _) = encoder();
        assert!(enc.normalize_event(EventRecord::new("", at())).is_none());
        let ev = enc
            .normalize_event(
                EventRecord::new("k", at())
                    .with_count(0)
                    .with_sum(f64::NAN)
                    .with_segment("bad", f64::INFINITY)
                    .with_segment("ok", 2i64),
            )
            .unwrap();
        assert_eq!(ev.count, 1);
        assert_eq!(ev.sum, Some(0.0));
        assert!(!ev.segmentation.contains_key("bad"));
        assert_eq!(ev.segmentation.get("ok"), Some(&SegmentValue::Int(2)));
    }

    #[test]
    fn segmentation_types_preserved_and_capped() {
        let (enc, _) = encoder_with(LimitsConfig { max_segmentation_values: 2, ..Default::default() });
        let seg: Segmentation = [
            ("a".to_string(), SegmentValue::Int(1)),
            ("b".to_string(), SegmentValue::Double(1.5)),
            ("c".to_string(), SegmentValue::Bool(true)),
        ]
        .into_iter()
        .collect();
        let out = enc.normalize_segmentation(&seg);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("b"), Some(&SegmentValue::Double(1.5)));
    }

    #[test]
    fn begin_carries_metrics_and_end_omits_zero_duration() {
        let (enc, _) = encoder();
        let begin = enc.session_begin_blob(at()).unwrap();
        assert_eq!(begin.param("begin_session"), Some("1"));
        let metrics: Value = serde_json::from_str(begin.param("metrics").unwrap()).unwrap();
        assert_eq!(metrics["_os"], "linux");

        let end = enc.session_end_blob(at(), 0);
        assert_eq!(end.param("end_session"), Some("1"));
        assert_eq!(end.param("session_duration"), None);
        assert_eq!(enc.session_end_blob(at(), 12).param("session_duration"), Some("12"));
    }

    #[test]
    fn crash_limits_trace_and_breadcrumbs() {
        let (enc, _) = encoder_with(LimitsConfig {
            max_stack_trace_lines: 2,
            max_stack_trace_line_length: 5,
            max_breadcrumb_count: 1,
            ..Default::default()
        });
        let mut report = CrashReport::new("line-one\nline-two\nline-three", true);
        report.breadcrumbs = vec!["first".into(), "second".into()];
        let blob = enc.crash_blob(&report, at()).unwrap();
        assert_eq!(blob.kind, RequestKind::Crash);
        let crash: Value = serde_json::from_str(blob.param("crash").unwrap()).unwrap();
        assert_eq!(crash["_error"], "line-\nline-");
        assert_eq!(crash["_nonfatal"], true);
        assert_eq!(crash["_logs"], "second");
        assert_eq!(crash["_app_version"], "2.1");
        assert!(crash.get("_custom").is_none());
    }

    #[test]
    fn network_trace_metrics() {
        let (enc, _) = encoder();
        let trace = TraceRecord::Network {
            name: "/api/items".into(),
            response_code: 200,
            request_payload_bytes: 10,
            response_payload_bytes: 300,
            start_ms: 1_000,
            end_ms: 1_250,
        };
        let blob = enc.trace_blob(&trace, at()).unwrap();
        let apm: Value = serde_json::from_str(blob.param("apm").unwrap()).unwrap();
        assert_eq!(apm["type"], "network");
        assert_eq!(apm["name"], "/api/items");
        assert_eq!(apm["apm_metrics"]["response_time"], 250);
        assert_eq!(apm["apm_metrics"]["response_payload_size"], 300);
        assert_eq!(apm["stz"], 1_000);
        assert_eq!(apm["etz"], 1_250);
    }

    #[test]
    fn screen_time_trace_names() {
        let (enc, _) = encoder();
        let trace = TraceRecord::ScreenTime { foreground: false, start_ms: 0, end_ms: 5_000 };
        let apm: Value =
            serde_json::from_str(enc.trace_blob(&trace, at()).unwrap().param("apm").unwrap()).unwrap();
        assert_eq!(apm["name"], "app_in_background");
        assert_eq!(apm["type"], "device");
        assert_eq!(apm["apm_metrics"]["duration"], 5_000);
    }

    #[test]
    fn consent_payload_uses_feature_names() {
        let (enc, _) = encoder();
        let changes: BTreeMap<Feature, bool> =
            [(Feature::StarRating, true), (Feature::Sessions, false)].into_iter().collect();
        let blob = enc.consent_blob(&changes, at()).unwrap();
        assert_eq!(blob.param("consent"), Some(r#"{"sessions":false,"star-rating":true}"#));
    }

    #[test]
    fn health_blob_carries_counters() {
        let (enc, health) = encoder();
        health.log_error();
        let blob = enc.health_blob(at()).unwrap();
        assert_eq!(blob.kind, RequestKind::Health);
        let hc: Value = serde_json::from_str(blob.param("hc").unwrap()).unwrap();
        assert_eq!(hc["el"], 1);
        assert_eq!(blob.param("metrics"), Some(r#"{"_app_version":"2.1"}"#));
    }

    #[test]
    fn direct_blob_strips_reserved_keys() {
        let (enc, health) = encoder();
        let params = vec![
            ("app_key".to_string(), "other".to_string()),
            ("device_id".to_string(), "spoofed".to_string()),
            ("timestamp".to_string(), "42".to_string()),
            ("custom".to_string(), "1".to_string()),
        ];
        let blob = enc.direct_blob(&params, at()).unwrap();
        assert_eq!(blob.kind, RequestKind::Direct);
        assert_eq!(blob.param("app_key"), Some("app"));
        assert_eq!(blob.param("timestamp"), Some("42"));
        assert_eq!(blob.param("custom"), Some("1"));
        assert!(blob.requires_device_id);
        assert_eq!(blob.params.iter().filter(|(k, _)| k == "timestamp").count(), 1);
        assert_eq!(health.snapshot().warnings, 2);
    }

    #[test]
    fn direct_blob_of_only_reserved_keys_is_none() {
        let (enc, _) = encoder();
        let params = vec![("checksum256".to_string(), "x".to_string())];
        assert!(enc.direct_blob(&params, at()).is_none());
        assert!(enc.direct_blob(&[], at()).is_none());
    }
}
