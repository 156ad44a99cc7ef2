#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use beacon_core::{RequestKind, RequestObserver};
use beacon_pipeline::{Pipeline, PipelineConfig};
use beacon_store::{MemoryStorage, RequestLedger, Storage};
use beacon_transport::MockTransport;

pub fn config(device_id: &str) -> PipelineConfig {
    PipelineConfig {
        server_url: "https://collector.example".into(),
        app_key: "app".into(),
        device_id: Some(device_id.into()),
        test_tick_interval_ms: Some(10),
        ..Default::default()
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub storage: Arc<MemoryStorage>,
    pub transport: Arc<MockTransport>,
}

pub fn harness(config: PipelineConfig, transport: MockTransport) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(transport);
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let pipeline = Pipeline::builder(config)
        .storage(dyn_storage)
        .transport(transport.clone())
        .build()
        .unwrap();
    Harness {
        pipeline,
        storage,
        transport,
    }
}

impl Harness {
    pub fn kinds(&self) -> Vec<RequestKind> {
        self.storage.list().unwrap().iter().map(|b| b.kind).collect()
    }

    /// Session parameter that distinguishes begin/update/end.
    pub fn session_steps(&self) -> Vec<&'static str> {
        self.storage
            .list()
            .unwrap()
            .iter()
            .filter(|b| b.kind == RequestKind::Session)
            .map(|b| {
                if b.param("begin_session").is_some() {
                    "begin"
                } else if b.param("end_session").is_some() {
                    "end"
                } else {
                    "update"
                }
            })
            .collect()
    }
}

/// Records everything the drainer reports.
#[derive(Default)]
pub struct RecordingObserver {
    pub requests: Mutex<Vec<String>>,
    pub responses: Mutex<Vec<(Option<u16>, Option<Value>, Option<String>)>>,
}

impl RequestObserver for RecordingObserver {
    fn on_request(&self, serialized: &str) {
        self.requests.lock().push(serialized.to_owned());
    }

    fn on_response(&self, status: Option<u16>, body: Option<&Value>, error: Option<&str>) {
        self.responses
            .lock()
            .push((status, body.cloned(), error.map(str::to_owned)));
    }
}
