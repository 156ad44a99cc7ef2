use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use beacon_core::{CrashReport, EventRecord, Feature, SegmentValue, TimeInstant, TraceRecord};
use beacon_pipeline::{load_config_from_path, Pipeline, TickResult};
use beacon_store::{SqliteStorage, Storage};
use beacon_telemetry::{beacon_home, init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "beacon", about = "Queue telemetry and deliver it to a Countly-style collector")]
struct Cli {
    /// JSON config file. Missing files fall back to defaults plus BEACON_* env vars.
    #[arg(long, default_value_os_t = beacon_home().join("config.json"))]
    config: PathBuf,

    /// Durable request queue.
    #[arg(long, default_value_os_t = beacon_home().join("queue.db"))]
    db: PathBuf,

    /// Queue only; skip the drain pass after the command.
    #[arg(long)]
    no_send: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record one custom event.
    Event {
        key: String,
        #[arg(long, default_value_t = 1)]
        count: i64,
        #[arg(long)]
        sum: Option<f64>,
        #[arg(long)]
        dur: Option<f64>,
        /// `key=value`, repeatable.
        #[arg(long = "segment", value_parser = parse_segment)]
        segments: Vec<(String, String)>,
    },
    /// Report a crash with the given stack trace.
    Crash {
        stack_trace: String,
        #[arg(long)]
        nonfatal: bool,
        #[arg(long = "breadcrumb")]
        breadcrumbs: Vec<String>,
    },
    /// Report a custom performance trace.
    Trace {
        name: String,
        #[arg(long)]
        duration_ms: i64,
    },
    /// Begin a session, wait, then end it.
    SessionDemo {
        #[arg(long, default_value_t = 2)]
        seconds: u64,
    },
    ChangeId {
        id: String,
        #[arg(long)]
        merge: bool,
    },
    /// Grant or revoke consent, e.g. `consent sessions=true crashes=false`.
    Consent {
        #[arg(value_parser = parse_consent, required = true)]
        changes: Vec<(Feature, bool)>,
    },
    /// Queue a hand-built request, e.g. `direct begin_session=1`.
    Direct {
        #[arg(value_parser = parse_segment, required = true)]
        params: Vec<(String, String)>,
    },
    /// Drop every queued request without sending it.
    ClearQueue,
    /// Flush buffered events and drain the queue once.
    Flush,
    /// Print queue and health status as JSON.
    Status,
    /// Run the background worker until ctrl+c.
    Run,
}

fn parse_segment(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

fn parse_consent(s: &str) -> Result<(Feature, bool), String> {
    let (feature, allow) = s
        .split_once('=')
        .ok_or_else(|| format!("expected feature=true|false, got {s:?}"))?;
    let feature: Feature = feature.parse().map_err(|e| format!("{e}"))?;
    let allow = beacon_pipeline::config::parse_bool(allow).ok_or_else(|| format!("not a boolean: {allow:?}"))?;
    Ok((feature, allow))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(TelemetryConfig::default());

    let config = load_config_from_path(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(dir) = cli.db.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let storage: Arc<dyn Storage> =
        Arc::new(SqliteStorage::open(&cli.db).with_context(|| format!("opening {}", cli.db.display()))?);
    let pipeline = Pipeline::builder(config).storage(storage).build()?;

    let drain = match cli.command {
        Command::Event { key, count, sum, dur, segments } => {
            let mut event = EventRecord::new(key, TimeInstant::now()).with_count(count);
            if let Some(sum) = sum {
                event = event.with_sum(sum);
            }
            if let Some(dur) = dur {
                event = event.with_dur(dur);
            }
            for (k, v) in segments {
                event = event.with_segment(k, segment_value(&v));
            }
            pipeline.record_event(event)?;
            pipeline.flush_events()?;
            true
        }
        Command::Crash { stack_trace, nonfatal, breadcrumbs } => {
            let mut report = CrashReport::new(stack_trace, nonfatal);
            report.breadcrumbs = breadcrumbs;
            pipeline.send_crash_report(&report)?;
            true
        }
        Command::Trace { name, duration_ms } => {
            let end_ms = TimeInstant::now().timestamp;
            pipeline.send_trace(&TraceRecord::Custom {
                name,
                start_ms: end_ms - duration_ms,
                end_ms,
                metrics: Default::default(),
            })?;
            true
        }
        Command::SessionDemo { seconds } => {
            let session = pipeline.create_session();
            pipeline.begin_session(session)?;
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            pipeline.end_session(session)?;
            true
        }
        Command::ChangeId { id, merge } => {
            let report = pipeline.change_device_id(&id, merge)?;
            tracing::info!(
                purged = report.purged.len(),
                rewritten = report.rewritten,
                "device id changed"
            );
            true
        }
        Command::Consent { changes } => {
            if !pipeline.config().consent.required {
                bail!("consent is not required by the current config");
            }
            pipeline.set_consent(&changes)?;
            true
        }
        Command::Direct { params } => {
            if pipeline.add_direct_request(&params)?.is_none() {
                bail!("direct request was not queued");
            }
            true
        }
        Command::ClearQueue => {
            let removed = pipeline.flush_queues()?;
            tracing::info!(removed, "request queue cleared");
            false
        }
        Command::Flush => {
            pipeline.flush_events()?;
            true
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&pipeline.status()?)?);
            false
        }
        Command::Run => {
            pipeline.start()?;
            tracing::info!("beacon worker running");
            tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;
            pipeline.shutdown().await;
            return Ok(());
        }
    };

    if drain && !cli.no_send {
        let result = pipeline.tick().await?;
        match &result {
            TickResult::Finished { sent } => tracing::info!(sent, "queue drained"),
            other => tracing::warn!(result = ?other, "queue not fully drained, will retry on next run"),
        }
    }
    pipeline.shutdown().await;
    Ok(())
}

/// Numbers and booleans keep their type; everything else is a string.
fn segment_value(raw: &str) -> SegmentValue {
    if let Ok(n) = raw.parse::<i64>() {
        return SegmentValue::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return SegmentValue::from(f);
    }
    match raw {
        "true" => SegmentValue::from(true),
        "false" => SegmentValue::from(false),
        _ => SegmentValue::from(raw),
    }
}
