//! Access log: one entry per request/response pair.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rpc_protocol::{ConnectionContext, ResponseEnvelope};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

/// Severity of an access entry: `Error` when the request hit an
/// unexpected failure, `Info` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// One request/response pair.
#[derive(Debug, Clone, Copy)]
pub struct AccessEntry<'a> {
    pub connection: &'a ConnectionContext,
    pub level: LogLevel,
    pub elapsed: Duration,
    /// The request object, or the raw payload as a string if it did not parse.
    pub request: &'a Value,
    pub response: &'a ResponseEnvelope,
}

impl AccessEntry<'_> {
    /// Milliseconds with microsecond precision.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_micros() as f64 / 1000.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccessLogError {
    #[error("access log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("access log encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sink for access entries.
pub trait AccessLog: Send + Sync {
    fn record(&self, entry: &AccessEntry<'_>) -> Result<(), AccessLogError>;
}

/// Emits entries as `tracing` events on the `rpc::access` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, entry: &AccessEntry<'_>) -> Result<(), AccessLogError> {
        let response = serde_json::to_string(entry.response)?;
        let peer = entry.connection.peer();
        let elapsed_ms = format!("{:.3}", entry.elapsed_ms());
        match entry.level {
            LogLevel::Info => info!(
                target: "rpc::access",
                peer = %peer,
                elapsed_ms = %elapsed_ms,
                request = %entry.request,
                response = %response,
                "rpc/log"
            ),
            LogLevel::Error => error!(
                target: "rpc::access",
                peer = %peer,
                elapsed_ms = %elapsed_ms,
                request = %entry.request,
                response = %response,
                "rpc/log"
            ),
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    time: String,
    level: LogLevel,
    peer: String,
    elapsed_ms: f64,
    request: &'a Value,
    response: &'a ResponseEnvelope,
}

/// Appends entries as JSON lines to a file.
pub struct JsonLinesAccessLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAccessLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AccessLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| AccessLogError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AccessLogError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AccessLog for JsonLinesAccessLog {
    fn record(&self, entry: &AccessEntry<'_>) -> Result<(), AccessLogError> {
        let mut line = serde_json::to_vec(&JsonLine {
            time: chrono::Local::now().to_rfc3339(),
            level: entry.level,
            peer: entry.connection.peer(),
            elapsed_ms: entry.elapsed_ms(),
            request: entry.request,
            response: entry.response,
        })?;
        line.push(b'\n');
        self.file
            .lock()
            .write_all(&line)
            .map_err(|source| AccessLogError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Fans an entry out to several sinks. Every sink is attempted; the first
/// failure is reported.
#[derive(Default)]
pub struct AccessLogSet {
    sinks: Vec<Box<dyn AccessLog>>,
}

impl AccessLogSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AccessLog + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl AccessLog for AccessLogSet {
    fn record(&self, entry: &AccessEntry<'_>) -> Result<(), AccessLogError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(entry) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_lines_sink_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/access.log");
        let sink = JsonLinesAccessLog::open(&path).unwrap();

        let connection = ConnectionContext::new("c", "127.0.0.1", 9000);
        let request = json!({"class": "health", "method": "ping"});
        let response = ResponseEnvelope::ok("pong");
        for level in [LogLevel::Info, LogLevel::Error] {
            sink.record(&AccessEntry {
                connection: &connection,
                level,
                elapsed: Duration::from_micros(1500),
                request: &request,
                response: &response,
            })
            .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "info");
        assert_eq!(lines[1]["level"], "error");
        assert_eq!(lines[0]["peer"], "127.0.0.1:9000");
        assert_eq!(lines[0]["elapsed_ms"], 1.5);
        assert_eq!(lines[0]["request"]["method"], "ping");
        assert_eq!(lines[0]["response"]["msg"], "pong");
    }
}
