//! Typed facts that producers hand to the pipeline besides events and
//! session transitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Segmentation;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    /// Full stack trace text, lines separated by `\n`.
    pub stack_trace: String,
    pub nonfatal: bool,
    #[serde(default)]
    pub segmentation: Segmentation,
    /// Oldest first.
    #[serde(default)]
    pub breadcrumbs: Vec<String>,
}

impl CrashReport {
    pub fn new(stack_trace: impl Into<String>, nonfatal: bool) -> Self {
        Self {
            stack_trace: stack_trace.into(),
            nonfatal,
            ..Default::default()
        }
    }
}

/// Performance measurements reported through the `apm` parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trace", rename_all = "snake_case")]
pub enum TraceRecord {
    Custom {
        name: String,
        start_ms: i64,
        end_ms: i64,
        #[serde(default)]
        metrics: BTreeMap<String, i64>,
    },
    Network {
        name: String,
        response_code: u16,
        request_payload_bytes: u64,
        response_payload_bytes: u64,
        start_ms: i64,
        end_ms: i64,
    },
    AppStart {
        start_ms: i64,
        end_ms: i64,
    },
    /// Time spent in foreground (`true`) or background.
    ScreenTime {
        foreground: bool,
        start_ms: i64,
        end_ms: i64,
    },
}

impl TraceRecord {
    pub fn name(&self) -> &str {
        match self {
            Self::Custom { name, .. } | Self::Network { name, .. } => name,
            Self::AppStart { .. } => "app_start",
            Self::ScreenTime { foreground: true, .. } => "app_in_foreground",
            Self::ScreenTime { foreground: false, .. } => "app_in_background",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        let (start, end) = match self {
            Self::Custom { start_ms, end_ms, .. }
            | Self::Network { start_ms, end_ms, .. }
            | Self::AppStart { start_ms, end_ms }
            | Self::ScreenTime { start_ms, end_ms, .. } => (*start_ms, *end_ms),
        };
        end.saturating_sub(start).max(0)
    }
}
