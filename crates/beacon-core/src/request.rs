use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// Path every queued request is submitted to.
pub const INGEST_ENDPOINT: &str = "/i";

/// What produced a queued request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Session,
    Events,
    Crash,
    Trace,
    Consent,
    IdentityChange,
    Health,
    /// Caller-built parameters on top of the common block.
    Direct,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Events => "events",
            Self::Crash => "crash",
            Self::Trace => "trace",
            Self::Consent => "consent",
            Self::IdentityChange => "identity_change",
            Self::Health => "health",
            Self::Direct => "direct",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One serialized unit of outgoing work, as persisted in the ledger.
///
/// `params` holds the query parameters in insertion order. The device id is
/// kept apart in `device_id` so identity transitions can rewrite it without
/// touching the payload; it is spliced in only when the request is sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestBlob {
    pub id: RequestId,
    pub kind: RequestKind,
    pub params: Vec<(String, String)>,
    /// Blob must be sent under whatever id is current for the device.
    pub requires_device_id: bool,
    pub device_id: Option<String>,
    /// Creation time, unix milliseconds.
    pub created_at: i64,
}

impl RequestBlob {
    pub fn new(kind: RequestKind, params: Vec<(String, String)>) -> Self {
        Self {
            id: RequestId::new(),
            kind,
            params,
            requires_device_id: true,
            device_id: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Mark the blob as carrying an explicit device id that identity
    /// transitions must leave alone.
    pub fn with_fixed_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.requires_device_id = false;
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first parameter named `key`, or append it.
    pub fn set_param(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key.to_owned(), value)),
        }
    }

    pub fn is_identity_change(&self) -> bool {
        self.kind == RequestKind::IdentityChange
    }

    pub fn is_stamped_with(&self, device_id: &str) -> bool {
        self.device_id.as_deref() == Some(device_id)
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.created_at)
    }

    /// Build the wire form. `remaining` becomes the `rr` hint.
    pub fn to_outgoing(&self, remaining: usize) -> OutgoingRequest {
        let mut params = self.params.clone();
        if let Some(id) = &self.device_id {
            params.push(("device_id".into(), id.clone()));
        }
        params.push(("rr".into(), remaining.to_string()));
        OutgoingRequest {
            request_id: self.id.clone(),
            kind: self.kind,
            endpoint: INGEST_ENDPOINT.to_owned(),
            params,
        }
    }
}

/// A blob resolved against the current identity and ready for the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingRequest {
    pub request_id: RequestId,
    pub kind: RequestKind,
    pub endpoint: String,
    pub params: Vec<(String, String)>,
}

impl OutgoingRequest {
    /// `k=v&k=v` with both sides percent-encoded, in parameter order.
    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
