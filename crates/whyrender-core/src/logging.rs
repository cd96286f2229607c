//! `tracing` subscriber setup for hosts without their own.
//!
//! Render diagnostics use these field names throughout:
//! - `component`, `namespace`: component type
//! - `instance`: instance handle (`<index>v<generation>`)
//! - `trigger`: lifecycle trigger (`parameters-set`, `explicit-rerender`, ...)
//! - `type_name`: type whose metadata is being built
//! - `task`: maintenance task name
//!
//! ```ignore
//! use whyrender_core::logging::{init_logging, LogConfig, LogFormat};
//!
//! init_logging(&LogConfig {
//!     level: "whyrender_core=debug".to_string(),
//!     format: LogFormat::Json,
//!     file: Some("renders.log".into()),
//! })?;
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Pretty, Self::Json]
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown log format {s:?} (expected pretty or json)"))
    }
}

/// The `[logging]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// A level (`warn`) or a full filter directive
    /// (`info,whyrender_core::snapshot=trace`). `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
    /// Also append plain (never ANSI) lines to this file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Filter for this config, before any `RUST_LOG` override.
    pub fn env_filter(&self) -> Result<EnvFilter, LogError> {
        if !self.level.contains(['=', ',']) {
            parse_level(&self.level)?;
        }
        EnvFilter::try_new(&self.level).map_err(|_| LogError::InvalidLevel(self.level.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Parse a bare level name; `warning` is accepted for `warn`.
pub fn parse_level(raw: &str) -> Result<Level, LogError> {
    let name = raw.trim();
    let name = if name.eq_ignore_ascii_case("warning") { "warn" } else { name };
    Level::from_str(name).map_err(|_| LogError::InvalidLevel(raw.to_string()))
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => tfmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => tfmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, file: File) -> BoxedLayer {
    match format {
        LogFormat::Pretty => tfmt::layer().with_writer(file).with_ansi(false).boxed(),
        LogFormat::Json => tfmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(file)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. A second call fails with
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }
    let configured = config.env_filter()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let mut layers = vec![stderr_layer(config.format)];
    if let Some(path) = &config.file {
        layers.push(file_layer(config.format, open_append(path)?));
    }
    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(layers).with(filter),
    )?;
    let _ = INSTALLED.set(());

    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "render diagnostics logging initialized"
    );
    Ok(())
}

#[must_use]
pub fn is_logging_initialized() -> bool {
    INSTALLED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RenderTrigger;
    use crate::component::{ComponentType, InstanceRegistry};
    use crate::event::RenderEvent;
    use crate::sink::{RenderEventSink, TracingSink};
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    struct Counter;

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn levels_and_directives() {
        assert_eq!(parse_level("Warning").unwrap(), Level::WARN);
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert!(parse_level("loud").is_err());

        let directive = LogConfig {
            level: "info,whyrender_core::snapshot=trace".into(),
            ..LogConfig::default()
        };
        assert!(directive.env_filter().is_ok());
        let bogus = LogConfig {
            level: "loud".into(),
            ..LogConfig::default()
        };
        assert!(matches!(bogus.env_filter(), Err(LogError::InvalidLevel(_))));
    }

    #[test]
    fn section_from_toml() {
        let config: LogConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
        assert!(config.file.is_none());
    }

    #[test]
    fn wasteful_render_is_logged_at_warn_with_fields() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(
            tfmt::layer()
                .json()
                .with_writer(captured.clone())
                .flatten_event(true),
        );
        let mut event = RenderEvent::builder(
            ComponentType::new::<Counter>("Counter", "App"),
            InstanceRegistry::new().register(),
            RenderTrigger::ExplicitRerender,
        )
        .build();
        event.is_unnecessary = true;

        tracing::subscriber::with_default(subscriber, || {
            TracingSink.emit(&event).unwrap();
        });
        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["level"], "WARN");
        assert_eq!(lines[0]["component"], "Counter");
        assert_eq!(lines[0]["trigger"], "explicit-rerender");
        assert_eq!(lines[0]["is_unnecessary"], true);
    }

    #[test]
    fn second_install_is_rejected() {
        if init_logging(&LogConfig::default()).is_ok() {
            assert!(is_logging_initialized());
        }
        assert!(matches!(
            init_logging(&LogConfig::default()),
            Err(LogError::AlreadyInitialized | LogError::SetSubscriber(_))
        ));
    }
}
