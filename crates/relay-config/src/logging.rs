use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`) or a full filter such as `relay.rpc=trace,warn`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// One JSON object per event instead of plain lines.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Also append events to this file. A file that cannot be opened is reported once logging is
    /// up and otherwise ignored.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    /// Filter directives for this config, with `rust_log` appended so it wins on conflicts.
    fn directives(&self, rust_log: Option<&str>) -> String {
        let level = match self.level.trim() {
            "" => "info",
            level => level,
        };
        match rust_log.map(str::trim).filter(|extra| !extra.is_empty()) {
            Some(extra) => format!("{level},{extra}"),
            None => level.to_owned(),
        }
    }

    /// The filter `init_tracing` installs: `level` merged with `RUST_LOG`.
    ///
    /// Directives that do not parse are skipped; with nothing usable left, `info` applies.
    pub fn env_filter(&self) -> EnvFilter {
        let rust_log = std::env::var("RUST_LOG").ok();
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(self.directives(rust_log.as_deref()))
    }

    fn make_writer(&self, file: Option<File>) -> BoxMakeWriter {
        match (self.stderr, file) {
            (true, Some(file)) => BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file))),
            (true, None) => BoxMakeWriter::new(std::io::stderr),
            (false, Some(file)) => BoxMakeWriter::new(Mutex::new(file)),
            (false, None) => BoxMakeWriter::new(std::io::sink),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

static INIT: Once = Once::new();

/// Installs the global `tracing` subscriber described by `config`.
///
/// Only the first call in a process has any effect; it returns `true` if the subscriber was
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        let (file, file_error) = match &config.file {
            Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => (Some(file), None),
                Err(err) => (None, Some((path.clone(), err))),
            },
            None => (None, None),
        };

        let writer = config.make_writer(file);
        let fmt = tracing_subscriber::fmt::layer().with_ansi(false);
        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            fmt.json().with_writer(writer).boxed()
        } else {
            fmt.with_writer(writer).boxed()
        };

        let subscriber = Registry::default().with(config.env_filter()).with(layer);
        installed = tracing::subscriber::set_global_default(subscriber).is_ok();

        if let (true, Some((path, err))) = (installed, file_error) {
            tracing::warn!(
                target: "relay.config",
                path = %path.display(),
                error = %err,
                "log file unavailable; logging to the remaining sinks"
            );
        }
    });
    installed
}
