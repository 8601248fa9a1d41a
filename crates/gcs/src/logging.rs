//! Tracing subscriber setup for the agent binary.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

impl LogConfig {
    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        if std::env::var("RUST_LOG").is_ok() {
            return EnvFilter::from_default_env();
        }
        let level = match self.level.to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" | "fatal" | "panic" => "error",
            _ => "info",
        };
        EnvFilter::new(format!("gcs={level},gcs_bridge={level}"))
    }
}

/// Installs the global subscriber. A subscriber that is already installed
/// is left in place.
///
/// Fails only when the log file cannot be opened.
pub fn init_tracing(config: &LogConfig) -> io::Result<()> {
    let (writer, ansi) = match config.file {
        Some(ref path) => (BoxMakeWriter::new(Mutex::new(open_log_file(path)?)), false),
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let filter = config.filter();
    match config.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(writer));
            let _ = subscriber.try_init();
        }
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(ansi).with_writer(writer));
            let _ = subscriber.try_init();
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
