//! Shared types and capability traits for the beacon request pipeline.

pub mod consent;
pub mod device;
pub mod errors;
pub mod event;
pub mod facts;
pub mod ids;
pub mod request;
pub mod transport;

pub use consent::Feature;
pub use device::{DeviceIdMode, DeviceIdentity, TEMPORARY_DEVICE_ID};
pub use errors::TransportError;
pub use event::{EventRecord, SegmentValue, Segmentation, TimeInstant};
pub use facts::{CrashReport, TraceRecord};
pub use ids::{EventId, RequestId};
pub use request::{OutgoingRequest, RequestBlob, RequestKind, INGEST_ENDPOINT};
pub use transport::{MetricProvider, RequestObserver, StaticMetrics, Transport, TransportResponse};
