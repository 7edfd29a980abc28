//! Process-wide tracing setup.
//!
//! Logging starts on stdout at `info` before the config file is read. Once it
//! is, [`LogHandle::apply`] swaps in the configured level and tees every line
//! into the configured log file.

use std::fs;
use std::io;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use thiserror::Error;
use tracing::info;
use tracing::Subscriber;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::reload;
use tracing_subscriber::Registry;

use crate::config::PluginConfig;
use crate::constants;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unknown log level {0:?}")]
    InvalidLevel(String),
    #[error("failed to create log directory {}", .0.display())]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("failed to open log file in {}", .0.display())]
    OpenFile(PathBuf, #[source] tracing_appender::rolling::InitError),
    #[error("failed to apply log level")]
    Reload(#[from] reload::Error),
}

/// Runtime controls of the installed subscriber.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    file: Arc<RwLock<Option<NonBlocking>>>,
    guard: Option<WorkerGuard>,
}

/// Installs the global subscriber.
pub fn init() -> LogHandle {
    let (subscriber, handle) = build();
    subscriber.init();
    handle
}

pub(crate) fn build() -> (impl Subscriber + Send + Sync + 'static, LogHandle) {
    let (filter, filter_handle) = reload::Layer::new(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let file = Arc::new(RwLock::new(None));
    let writer = TeeMakeWriter { file: file.clone() };

    let subscriber = registry()
        .with(filter)
        .with(utils::logging::get_fmt_layer(writer));

    (
        subscriber,
        LogHandle {
            filter: filter_handle,
            file,
            guard: None,
        },
    )
}

impl LogHandle {
    /// Applies the level and log file of `config`. Empty values keep the
    /// current setting.
    pub fn apply(&mut self, config: &PluginConfig, log_dir: &Path) -> Result<(), LoggingError> {
        if !config.log_file.is_empty() {
            info!("setting log directory: {}", log_dir.display());
            fs::create_dir_all(log_dir)
                .and_then(|()| {
                    fs::set_permissions(
                        log_dir,
                        fs::Permissions::from_mode(constants::LOG_DIR_PERMISSIONS),
                    )
                })
                .map_err(|e| LoggingError::CreateDir(log_dir.to_path_buf(), e))?;

            info!("setting log file: {}", config.log_file);
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(&config.log_file)
                .build(log_dir)
                .map_err(|e| LoggingError::OpenFile(log_dir.to_path_buf(), e))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            *self.file.write().unwrap_or_else(PoisonError::into_inner) = Some(writer);
            self.guard = Some(guard);
        }

        if let Some(level) = parse_level(&config.log_level)? {
            info!("setting log level: {level}");
            self.filter
                .reload(EnvFilter::default().add_directive(level.into()))?;
        }

        Ok(())
    }
}

/// Parses a level name. The aliases `warning`, `fatal` and `panic` are
/// accepted, an empty string means no change.
pub fn parse_level(raw: &str) -> Result<Option<LevelFilter>, LoggingError> {
    let level = match raw.trim().to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "warning" => LevelFilter::WARN,
        "fatal" | "panic" => LevelFilter::ERROR,
        other => LevelFilter::from_str(other).map_err(|_| LoggingError::InvalidLevel(raw.to_string()))?,
    };
    Ok(Some(level))
}

/// Writes every line to stdout and, once configured, to the log file.
#[derive(Clone)]
struct TeeMakeWriter {
    file: Arc<RwLock<Option<NonBlocking>>>,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self
                .file
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

struct TeeWriter {
    file: Option<NonBlocking>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}
