use chrono::Local;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "DEBUG" | "TRACE" => LogLevel::Debug,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
pub struct LogGuard {
    path: Option<PathBuf>,
    _worker: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn env_filter(level: Option<LogLevel>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(level.unwrap_or(LogLevel::Info).directive())
    })
}

/// Log file name for a session started at the current local time.
pub fn log_file_name() -> String {
    format!("{}.log", Local::now().format("%Y-%m-%dT%H%M%S"))
}

/// Install the global tracing subscriber.
///
/// With `print` set, lines go to stderr. Otherwise a timestamped file is
/// created under `log_dir` (default: current directory) and written through a
/// non-blocking appender. `RUST_LOG` takes precedence over `level`. Calling
/// this twice is harmless; the second subscriber is ignored.
pub fn init_tracing(level: Option<LogLevel>, log_dir: Option<PathBuf>, print: bool) -> LogGuard {
    if print {
        let _ = tracing_subscriber::registry()
            .with(env_filter(level))
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
        return LogGuard {
            path: None,
            _worker: None,
        };
    }

    let log_dir = log_dir.unwrap_or_else(|| PathBuf::from("."));
    let log_path = log_dir.join(log_file_name());
    let _ = std::fs::create_dir_all(&log_dir);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path);

    match file {
        Ok(file) => {
            let (non_blocking, worker) = tracing_appender::non_blocking(file);
            let _ = tracing_subscriber::registry()
                .with(env_filter(level))
                .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
                .try_init();
            LogGuard {
                path: Some(log_path),
                _worker: Some(worker),
            }
        }
        Err(_) => LogGuard {
            path: None,
            _worker: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_common_spellings() {
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("error"), LogLevel::Error);
        assert_eq!(LogLevel::parse("nonsense"), LogLevel::Info);
    }

    #[test]
    fn file_logging_creates_log_under_directory() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let guard = init_tracing(Some(LogLevel::Debug), Some(dir.path().to_path_buf()), false);
        let path = guard.path().expect("log path should be returned");
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
    }
}
