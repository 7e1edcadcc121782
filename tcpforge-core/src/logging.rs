//! Logging setup.
//!
//! The engine logs through `tracing` macros and never installs a subscriber
//! itself. Applications call [`init`] once at startup to route those events
//! to a sink:
//!
//! ```no_run
//! use tcpforge_core::logging::{self, LogFormat, LogSink};
//!
//! # fn main() -> tcpforge_core::Result<()> {
//! let _guard = logging::init(
//!     LogSink::File {
//!         dir: "logs".into(),
//!         file_name: "server.log".into(),
//!     },
//!     LogFormat::Compact,
//! )?;
//! tracing::info!("ready");
//! # Ok(())
//! # }
//! ```
//!
//! Filtering honours `RUST_LOG` and defaults to `info`.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    /// Standard error.
    Stderr,
    /// Standard output.
    Stdout,
    /// A file inside `dir`, appended to. The directory is created if missing.
    File {
        /// Directory holding the log file.
        dir: PathBuf,
        /// File name inside `dir`.
        file_name: String,
    },
}

/// How each log line is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-field human readable lines.
    #[default]
    Full,
    /// Shorter single-line output.
    Compact,
    /// One JSON object per line.
    Json,
}

/// Shared, closable handle on a log file.
#[derive(Clone, Debug)]
pub struct FileSink {
    inner: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl FileSink {
    /// Opens (creating if needed) `dir/file_name` for appending.
    ///
    /// # Errors
    ///
    /// [`Error::Logging`] if the directory or file cannot be created.
    pub fn open(dir: &std::path::Path, file_name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::Logging(format!("cannot create log directory {}: {}", dir.display(), e))
        })?;
        let path = dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Logging(format!("cannot open {}: {}", path.display(), e)))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Some(BufWriter::new(file)))),
        })
    }

    /// Flushes and closes the file. Later writes are discarded.
    pub fn close(&self) {
        if let Some(mut writer) = self.lock().take() {
            let _ = writer.flush();
        }
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keeps the log file open. Dropping it flushes and closes the file.
#[must_use = "dropping the guard closes the log file"]
#[derive(Debug)]
pub struct LogGuard {
    file: Option<FileSink>,
}

impl LogGuard {
    /// Flushes and closes the log file, if any. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(file) = &self.file {
            file.close();
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// [`Error::Logging`] if the file sink cannot be opened or a global
/// subscriber is already installed.
pub fn init(sink: LogSink, format: LogFormat) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, file) = match sink {
        LogSink::Stderr => (BoxMakeWriter::new(io::stderr), None),
        LogSink::Stdout => (BoxMakeWriter::new(io::stdout), None),
        LogSink::File { dir, file_name } => {
            let file = FileSink::open(&dir, &file_name)?;
            (BoxMakeWriter::new(file.clone()), Some(file))
        }
    };
    let ansi = file.is_none();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Full => fmt::layer().with_writer(writer).with_ansi(ansi).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    Ok(LogGuard { file })
}
