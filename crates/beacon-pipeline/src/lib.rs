//! Durable request pipeline: producers queue telemetry facts, a single
//! drainer delivers them in order to the collector.

pub mod backoff;
pub mod config;
pub mod consent;
pub mod crawler;
pub mod drainer;
pub mod encoder;
pub mod error;
pub mod events;
pub mod health;
pub mod identity;
pub mod outcome;
pub mod pipeline;
pub mod queue;
pub mod sessions;

pub use config::{load_config_from_path, PipelineConfig};
pub use drainer::TickResult;
pub use error::{PipelineError, Result};
pub use health::HealthCounters;
pub use identity::TransitionReport;
pub use outcome::{DropReason, QueueEvent, RequestHandle, RequestOutcome};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStatus};
pub use sessions::SessionHandle;
