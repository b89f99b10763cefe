//! Process-wide tracing setup: a console layer on stderr plus an optional
//! SQLite layer keeping WARN and ERROR events for later inspection.

mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Base level when `RUST_LOG` is unset.
    pub log_level: Level,
    /// Per-crate overrides appended to the base level, e.g. `switchboard_runtime=debug`.
    pub module_levels: Vec<(String, Level)>,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_to_sqlite: true,
            log_db_path: home_fallback().join("logs.db"),
        }
    }
}

impl TelemetryConfig {
    fn directives(&self) -> String {
        std::iter::once(self.log_level.as_str().to_lowercase())
            .chain(
                self.module_levels
                    .iter()
                    .map(|(module, level)| format!("{module}={}", level.as_str().to_lowercase())),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Returned by [`init_telemetry`]; holds the persisted-log sink if one opened.
pub struct TelemetryGuard {
    sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.sink.as_deref()
    }
}

// stdout is reserved for command output.
fn console_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        layer.json().with_span_list(true).boxed()
    } else {
        layer.boxed()
    }
}

fn open_sink(config: &TelemetryConfig) -> Option<Arc<SqliteLogSink>> {
    if !config.log_to_sqlite {
        return None;
    }
    match SqliteLogSink::new(&config.log_db_path) {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            eprintln!(
                "switchboard-telemetry: log database {} unavailable: {e}",
                config.log_db_path.display()
            );
            None
        }
    }
}

/// Install the global subscriber. Only the first call in a process wins;
/// later calls still return a guard over their own sink.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let sink = open_sink(&config);

    let installed = tracing_subscriber::registry()
        .with(console_layer(config.json).with_filter(filter))
        .with(sink.clone().map(SqliteLogLayer::new))
        .try_init();
    if installed.is_err() {
        eprintln!("switchboard-telemetry: a global subscriber is already installed");
    }

    TelemetryGuard { sink }
}

/// `$HOME/.switchboard`, or `/tmp/.switchboard` without a home directory.
pub fn home_fallback() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".switchboard")
}
