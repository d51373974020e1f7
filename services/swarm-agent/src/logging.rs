//! Logging initialization for the swarm agent.
//!
//! Human-readable logs go to stderr. When a log file is configured, the same
//! events are also written there as JSON lines, up to a size cap.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Maximum log file size (64 MiB).
pub const MAX_LOG_BYTES: usize = 64 * 1024 * 1024;

/// Log file writer that drops output past a size cap.
struct CappedWriter {
    file: File,
    bytes_written: usize,
    max_bytes: usize,
}

impl CappedWriter {
    fn new(path: &Path, max_bytes: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            bytes_written: 0,
            max_bytes,
        })
    }
}

impl Write for CappedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.bytes_written >= self.max_bytes {
            return Ok(buf.len());
        }

        let remaining = self.max_bytes - self.bytes_written;
        let to_write = buf.len().min(remaining);
        let written = self.file.write(&buf[..to_write])?;
        self.bytes_written += written;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Initialize logging to stderr and, if given, a JSON log file.
pub fn init(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let writer = CappedWriter::new(path, MAX_LOG_BYTES)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Mutex::new(writer))
                    .boxed(),
            )
        }
        None => None,
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
