use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use beacon_core::{OutgoingRequest, Transport, TransportError, TransportResponse};

/// Pre-programmed replies for deterministic tests without a collector.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// `200 {"result":"Success"}`.
    Accept,
    Error(TransportError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        Self::Error(TransportError::from_status(status, format!("mock status {status}")))
    }

    pub fn network(msg: &str) -> Self {
        Self::Error(TransportError::Network(msg.to_owned()))
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Transport that answers from a script and records what it was asked.
/// Once the script is exhausted every call gets `fallback`.
pub struct MockTransport {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<MockReply>,
    sent: Mutex<Vec<OutgoingRequest>>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub fn new(script: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(MockReply::Accept),
            sent: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Accepts everything.
    pub fn accepting() -> Self {
        Self::new(Vec::new())
    }

    /// Fails everything with a network error.
    pub fn failing() -> Self {
        let t = Self::new(Vec::new());
        t.set_fallback(MockReply::network("offline"));
        t
    }

    pub fn set_fallback(&self, reply: MockReply) {
        *self.fallback.lock() = reply;
    }

    pub fn push(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> Vec<OutgoingRequest> {
        self.sent.lock().clone()
    }

    /// Values of one parameter across every recorded request, in send order.
    pub fn sent_param(&self, key: &str) -> Vec<Option<String>> {
        self.sent
            .lock()
            .iter()
            .map(|r| r.param(key).map(str::to_owned))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: &OutgoingRequest) -> Result<TransportResponse, TransportError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.sent.lock().push(request.clone());
        let reply = {
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.lock().clone())
        };
        resolve(reply).await
    }
}

/// Unrolls nested delays iteratively.
async fn resolve(reply: MockReply) -> Result<TransportResponse, TransportError> {
    let mut current = reply;
    loop {
        match current {
            MockReply::Accept => {
                return Ok(TransportResponse {
                    status: 200,
                    body: Some(serde_json::json!({"result": "Success"})),
                })
            }
            MockReply::Error(e) => return Err(e),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
