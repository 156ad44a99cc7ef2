mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "beacon_transport" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: beacon_home().join("logs.db"),
        }
    }
}

/// Handle kept by the host for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    base_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    filter_handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        if let Some(handle) = &self.filter_handle {
            if let Err(e) = handle.reload(EnvFilter::new(directives)) {
                tracing::warn!(error = %e, module, "failed to reload log filter");
            }
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    let mut filter = base.to_string().to_lowercase();
    for (module, level) in modules {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let module_levels = Arc::new(RwLock::new(config.module_levels.clone()));

    let directives = filter_directives(config.log_level, &config.module_levels);
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).is_ok();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (env_filter, handle) = reload::Layer::new(env_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("beacon-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("beacon-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        log_sink: sqlite_sink,
        base_level: config.log_level,
        module_levels,
        // RUST_LOG wins over runtime overrides.
        filter_handle: if from_env { None } else { Some(handle) },
    }
}

/// `$BEACON_HOME`, else `$HOME/.beacon`.
pub fn beacon_home() -> PathBuf {
    if let Ok(dir) = std::env::var("BEACON_HOME") {
        return PathBuf::from(dir);
    }
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".beacon")
}
