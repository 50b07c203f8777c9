// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    env,
    io::IsTerminal,
    sync::{
        Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter,
    layer::{Layered, SubscriberExt},
    reload,
};

/// Deserializes a string value, using `Default::default()` if the string is
/// empty.
///
/// Lets configuration files and environment variables leave an enum field
/// blank instead of omitting it.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// The default directory name for log files when file logging is enabled.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Handle for changing the level filter at runtime.
///
/// Set by the first successful [`init_global_logging`].
pub static RELOAD_HANDLE: OnceCell<reload::Handle<filter::Targets, Registry>> = OnceCell::new();

/// Default log level filter when neither the options nor `RUST_LOG` set one.
const DEFAULT_LOG_TARGETS: &str = "info";

#[derive(Debug, Snafu)]
pub enum LoggingError {
    #[snafu(display("Failed to install the log-to-tracing bridge"))]
    LogBridge {
        source: tracing_log::log::SetLoggerError,
    },

    #[snafu(display("Failed to create rolling log file in {dir}"))]
    Appender {
        dir:    String,
        source: tracing_appender::rolling::InitError,
    },

    #[snafu(display("Invalid log level filter {level:?}"))]
    LevelFilter {
        level:  String,
        source: filter::ParseError,
    },

    #[snafu(display("A global tracing subscriber is already installed"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for log files, rotated hourly. Empty disables file logging.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Level filter such as `"info"` or `"info,shmq_queue=debug"`. Falls back
    /// to `RUST_LOG`, then `"info"`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log kind.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,

    /// Send console output to stderr, keeping stdout free for program output.
    #[builder(default)]
    pub console_stderr: bool,
}

/// Available log output formats.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, for log pipelines.
    Json,

    /// Human-readable lines.
    #[default]
    Text,
}

/// Initialize stdout logging with default options.
///
/// The returned guards must be kept alive for logging to function.
pub fn init_tracing_subscriber(app_name: &str) -> Result<Vec<WorkerGuard>, LoggingError> {
    init_global_logging(app_name, &LoggingOptions::default())
}

/// Initialize logging for unit tests.
///
/// Logs go to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) at
/// `UNITTEST_LOG_LEVEL` (default `debug`). Safe to call from every test; only
/// the first call does anything.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());

        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };
        match init_global_logging("unittest", &opts) {
            Ok(guards) => {
                if let Ok(mut g) = GLOBAL_UT_LOG_GUARD.lock() {
                    *g = Some(guards);
                }
                tracing::info!("logs dir = {}", dir);
            }
            Err(e) => eprintln!("unit test logging disabled: {e}"),
        }
    });
}

/// Keeps the unit test writers alive for the whole test binary.
static GLOBAL_UT_LOG_GUARD: Lazy<Mutex<Option<Vec<WorkerGuard>>>> = Lazy::new(|| Mutex::new(None));

type FilteredRegistry = Layered<reload::Layer<filter::Targets, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Install the global tracing subscriber.
///
/// Layers:
///
/// - **Console**: stdout, or stderr with `console_stderr`, if `append_stdout`
///   is set
/// - **File**: `<dir>/<app_name>.*`, rotated hourly, if `dir` is set
/// - **Error file**: `<dir>/<app_name>-err.*`, errors only, if `dir` is set
///
/// `log` records are bridged into tracing. Only the first call installs
/// anything; later calls return no guards.
///
/// The returned guards must be kept alive for the lifetime of the program.
/// Dropping them flushes and stops the background writers.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, LoggingError> {
    static INITIALIZED: AtomicBool = AtomicBool::new(false);
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Ok(Vec::new());
    }

    let result = install(app_name, opts);
    if result.is_err() {
        INITIALIZED.store(false, Ordering::Release);
    }
    result
}

fn install(app_name: &str, opts: &LoggingOptions) -> Result<Vec<WorkerGuard>, LoggingError> {
    let mut guards = vec![];
    let mut layers: Vec<BoxedLayer> = vec![];

    if opts.append_stdout {
        let (writer, guard, ansi) = if opts.console_stderr {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, std::io::stderr().is_terminal())
        } else {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            (writer, guard, std::io::stdout().is_terminal())
        };
        guards.push(guard);

        layers.push(if opts.log_format == LogFormat::Json {
            tracing_subscriber::fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_current_span(true)
                .with_span_list(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::Layer::new()
                .with_writer(writer)
                .with_ansi(ansi)
                .boxed()
        });
    }

    if !opts.dir.is_empty() {
        let (writer, guard) = tracing_appender::non_blocking(rolling_appender(opts, app_name)?);
        guards.push(guard);
        layers.push(if opts.log_format == LogFormat::Json {
            tracing_subscriber::fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(true)
                .with_span_list(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::Layer::new()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        });

        let (writer, guard) =
            tracing_appender::non_blocking(rolling_appender(opts, &format!("{app_name}-err"))?);
        guards.push(guard);
        layers.push(if opts.log_format == LogFormat::Json {
            tracing_subscriber::fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter::LevelFilter::ERROR)
                .boxed()
        } else {
            tracing_subscriber::fmt::Layer::new()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter::LevelFilter::ERROR)
                .boxed()
        });
    }

    let level = opts
        .level
        .clone()
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_string());
    let targets = level
        .parse::<filter::Targets>()
        .context(LevelFilterSnafu { level: &level })?;
    let (dyn_filter, reload_handle) = reload::Layer::new(targets);

    let subscriber = Registry::default().with(dyn_filter).with(layers);
    tracing::subscriber::set_global_default(subscriber).context(SubscriberSnafu)?;
    LogTracer::init().context(LogBridgeSnafu)?;
    let _ = RELOAD_HANDLE.set(reload_handle);

    Ok(guards)
}

fn rolling_appender(opts: &LoggingOptions, prefix: &str) -> Result<RollingFileAppender, LoggingError> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .context(AppenderSnafu { dir: &opts.dir })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = LoggingOptions::default();
        assert!(opts.dir.is_empty());
        assert_eq!(opts.level, None);
        assert_eq!(opts.log_format, LogFormat::Text);
        assert_eq!(opts.max_log_files, 720);
        assert!(opts.append_stdout);
        assert!(!opts.console_stderr);
    }

    #[test]
    fn test_builder_matches_defaults() {
        let built = LoggingOptions::builder().build();
        assert_eq!(built, LoggingOptions::default());

        let built = LoggingOptions::builder()
            .dir(DEFAULT_LOGGING_DIR.to_string())
            .level("debug".to_string())
            .log_format(LogFormat::Json)
            .build();
        assert_eq!(built.dir, "logs");
        assert_eq!(built.level.as_deref(), Some("debug"));
        assert_eq!(built.log_format, LogFormat::Json);
    }

    #[test]
    fn test_deserialize_blank_format_as_default() {
        let opts: LoggingOptions =
            serde_json::from_str(r#"{"log_format": "", "append_stdout": false}"#).unwrap();
        assert_eq!(opts.log_format, LogFormat::Text);
        assert!(!opts.append_stdout);
        assert_eq!(opts.max_log_files, 720);

        let opts: LoggingOptions = serde_json::from_str(r#"{"log_format": "json"}"#).unwrap();
        assert_eq!(opts.log_format, LogFormat::Json);
    }

    #[test]
    fn test_log_format_display() {
        assert_eq!(LogFormat::Json.to_string(), "Json");
        assert_eq!(LogFormat::Text.to_string(), "Text");
    }
}
