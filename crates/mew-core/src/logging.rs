//! Shared logging initialization for MEW binaries.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::fmt::MakeWriter;

static INIT: OnceLock<()> = OnceLock::new();

/// Environment variable naming a file that mirrors all log output.
pub const LOG_FILE_ENV: &str = "GATEWAY_LOG_FILE";

fn parse_level(explicit: Option<&str>) -> tracing::Level {
    let raw = explicit
        .map(str::to_string)
        .or_else(|| std::env::var("MEW_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    match raw.to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output.
///
/// Level priority: the explicit argument (CLI flag), then `MEW_LOG`, then
/// `info`. When `GATEWAY_LOG_FILE` is set, output is mirrored to that file
/// in addition to stderr, timestamps included.
///
/// Safe to call multiple times; only the first call installs the
/// subscriber. Intentionally best-effort and never returns an error.
pub fn init(explicit_level: Option<&str>) {
    if INIT.get().is_some() {
        return;
    }
    let level = parse_level(explicit_level);
    let mirror = std::env::var(LOG_FILE_ENV).ok().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()
            .map(|file| Arc::new(Mutex::new(file)))
    });

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(TeeMakeWriter { mirror })
        .try_init();
    let _ = INIT.set(());
}

/// `MakeWriter` that duplicates every log line to stderr and an optional
/// mirror file.
#[derive(Clone)]
struct TeeMakeWriter {
    mirror: Option<Arc<Mutex<File>>>,
}

struct TeeWriter {
    mirror: Option<Arc<Mutex<File>>>,
    stderr: io::Stderr,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            mirror: self.mirror.clone(),
            stderr: io::stderr(),
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(mirror) = &self.mirror
            && let Ok(mut file) = mirror.lock()
        {
            let _ = file.write_all(buf);
        }
        self.stderr.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(mirror) = &self.mirror
            && let Ok(mut file) = mirror.lock()
        {
            let _ = file.flush();
        }
        self.stderr.flush()
    }
}
