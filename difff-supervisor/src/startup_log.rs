//! Append-only startup log with single-backup rotation.
//!
//! One line per entry:
//! `<timestamp> <LEVEL> <event> build_id=<json> pid=<json> key=<json> ...`

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Size at which the log is moved aside before the next write.
pub const ROTATE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Cloneable handle to the startup log of one run.
///
/// Every write is best-effort: I/O failures are reported through `tracing`
/// and never surface to the caller.
#[derive(Debug, Clone)]
pub struct StartupLog {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    build_id: String,
    // Serializes rotate + append between the startup and shutdown paths.
    write_lock: Mutex<()>,
}

impl StartupLog {
    pub fn new(path: impl Into<PathBuf>, build_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                build_id: build_id.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn build_id(&self) -> &str {
        &self.inner.build_id
    }

    pub fn info(&self, event: &str, fields: Value) {
        self.write(LogLevel::Info, event, fields);
    }

    pub fn warn(&self, event: &str, fields: Value) {
        self.write(LogLevel::Warn, event, fields);
    }

    pub fn error(&self, event: &str, fields: Value) {
        self.write(LogLevel::Error, event, fields);
    }

    fn write(&self, level: LogLevel, event: &str, fields: Value) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = format_line(
            &timestamp,
            level,
            event,
            &self.inner.build_id,
            std::process::id(),
            fields,
        );

        let message = console_message(&line, &timestamp, level);
        match level {
            LogLevel::Info => info!(target: "startup", "{}", message),
            LogLevel::Warn => warn!(target: "startup", "{}", message),
            LogLevel::Error => error!(target: "startup", "{}", message),
        }

        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Non-fatal: logging must never be the reason a startup fails.
        if let Err(e) = append_line(&self.inner.path, &line) {
            debug!(
                "Failed to write startup log {}: {}",
                self.inner.path.display(),
                e
            );
        }
    }
}

/// Render one entry. `build_id` and `pid` lead; `fields` follow in insertion
/// order. A non-object `fields` value is recorded under `detail`.
pub fn format_line(
    timestamp: &str,
    level: LogLevel,
    event: &str,
    build_id: &str,
    pid: u32,
    fields: Value,
) -> String {
    let mut merged = Map::new();
    merged.insert("build_id".to_string(), Value::from(build_id));
    merged.insert("pid".to_string(), Value::from(pid));
    match fields {
        Value::Object(map) => merged.extend(map),
        Value::Null => {}
        other => {
            merged.insert("detail".to_string(), other);
        }
    }

    let body = merged
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} {} {} {}\n", timestamp, level, event, body)
}

/// The entry as mirrored to `tracing`, which supplies its own timestamp and
/// level: event name and fields only.
fn console_message<'a>(line: &'a str, timestamp: &str, level: LogLevel) -> &'a str {
    let prefix = format!("{} {} ", timestamp, level);
    line.strip_prefix(prefix.as_str()).unwrap_or(line).trim_end()
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    rotate_if_needed(path);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

/// Move a log at or above [`ROTATE_BYTES`] to `<path>.1`, replacing any
/// previous backup.
pub fn rotate_if_needed(path: &Path) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    if metadata.len() < ROTATE_BYTES {
        return;
    }

    let backup = backup_path(path);
    // Non-fatal: a stale backup that cannot be removed is overwritten by rename.
    let _ = std::fs::remove_file(&backup);
    if let Err(e) = std::fs::rename(path, &backup) {
        debug!("Failed to rotate startup log {}: {}", path.display(), e);
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".1");
    PathBuf::from(name)
}
