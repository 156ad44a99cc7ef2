use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EventId;

/// Typed segmentation value. The JSON form keeps the type distinguishable:
/// `3`, `3.0`, `true` and `"3"` decode back to four different variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SegmentValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl From<&str> for SegmentValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for SegmentValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for SegmentValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SegmentValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for SegmentValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

pub type Segmentation = BTreeMap<String, SegmentValue>;

/// Wall-clock stamp attached to every recorded fact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeInstant {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub hour: u32,
    /// 0 = Sunday.
    pub dow: u32,
    /// Offset from UTC in minutes.
    pub tz_minutes: i32,
}

impl TimeInstant {
    pub fn now() -> Self {
        Self::from_local(Local::now())
    }

    pub fn from_millis(ms: i64) -> Self {
        match Local.timestamp_millis_opt(ms).single() {
            Some(dt) => Self::from_local(dt),
            None => Self::from_local(Local::now()),
        }
    }

    fn from_local(dt: DateTime<Local>) -> Self {
        Self {
            timestamp: dt.with_timezone(&Utc).timestamp_millis(),
            hour: dt.hour(),
            dow: dt.weekday().num_days_from_sunday(),
            tz_minutes: dt.offset().local_minus_utc() / 60,
        }
    }
}

/// One recorded analytics event waiting in the event buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segmentation: Segmentation,
    pub count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    pub timestamp: i64,
    pub hour: u32,
    pub dow: u32,
    pub id: EventId,
}

impl EventRecord {
    pub fn new(key: impl Into<String>, at: TimeInstant) -> Self {
        Self {
            key: key.into(),
            segmentation: Segmentation::new(),
            count: 1,
            sum: None,
            dur: None,
            timestamp: at.timestamp,
            hour: at.hour,
            dow: at.dow,
            id: EventId::new(),
        }
    }

    pub fn with_segment(mut self, key: impl Into<String>, value: impl Into<SegmentValue>) -> Self {
        self.segmentation.insert(key.into(), value.into());
        self
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = count;
        self
    }

    pub fn with_sum(mut self, sum: f64) -> Self {
        self.sum = Some(sum);
        self
    }

    pub fn with_dur(mut self, dur: f64) -> Self {
        self.dur = Some(dur);
        self
    }
}
