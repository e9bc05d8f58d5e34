//! Audit trail and request logging.
//!
//! Admission rejections and flagged requests are appended as JSON lines to
//! an optional audit file.  The file rotates by size: `audit.log` becomes
//! `audit.log.1` (optionally gzipped to `audit.log.1.gz`), older backups
//! shift up, and at most `keep` of them are retained.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::util::client_identity;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

pub struct RotatingWriter {
    path: PathBuf,
    file: File,
    size: u64,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            size,
            rotation,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// `<path>.<idx><suffix>`
    pub fn backup_path(&self, idx: usize, suffix: &str) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(format!(".{}{}", idx, suffix));
        PathBuf::from(name)
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.size >= limit {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)?;
        self.size += line.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let keep = self.rotation.keep;
        if keep > 0 {
            for idx in (1..keep).rev() {
                for suffix in ["", ".gz"] {
                    let from = self.backup_path(idx, suffix);
                    if from.exists() {
                        fs::rename(&from, self.backup_path(idx + 1, suffix))?;
                    }
                }
            }
            let first = self.backup_path(1, "");
            fs::rename(&self.path, &first)?;
            if self.rotation.compress {
                gzip_in_place(&first)?;
            }
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

fn gzip_in_place(path: &Path) -> io::Result<()> {
    let data = fs::read(path)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&data)?;
    let mut target: OsString = path.as_os_str().to_owned();
    target.push(".gz");
    fs::write(PathBuf::from(target), gz.finish()?)?;
    fs::remove_file(path)
}

/// Fields mirrored to the tracing output for every audit line.
pub struct AuditLogFields<'a> {
    pub decision: &'a str,
    pub guard: Option<&'a str>,
    pub identity: &'a str,
}

#[derive(Clone)]
pub struct AuditSink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    file_size_bytes: Arc<AtomicU64>,
}

impl AuditSink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        let size = writer.as_ref().map(|w| w.size()).unwrap_or(0);
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
            file_size_bytes: Arc::new(AtomicU64::new(size)),
        }
    }

    pub fn open(path: &str, rotation: RotationConfig, log_stdout: bool) -> Self {
        match RotatingWriter::open(path, rotation) {
            Ok(w) => Self::new(Some(w), log_stdout),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "failed to open audit log; audit records disabled");
                Self::new(None, log_stdout)
            }
        }
    }

    pub fn emit(&self, record: &serde_json::Value, log: &AuditLogFields<'_>) {
        let wrote = self.write(record);
        if (wrote || self.writer.is_none()) && self.log_stdout {
            tracing::info!(
                target: "audit",
                decision = log.decision,
                guard = ?log.guard,
                identity = log.identity,
                "admission audit"
            );
        }
    }

    fn write(&self, record: &serde_json::Value) -> bool {
        let Some(writer) = &self.writer else {
            return false;
        };
        let mut guard = writer.lock().unwrap_or_else(|p| p.into_inner());
        match guard.write_line(&record.to_string()) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                self.file_size_bytes.store(guard.size(), Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write audit line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes.load(Ordering::Relaxed)
    }
}

static SCANNER_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(wp-|admin|\.php|\.env)").expect("static regex"));

/// True for a 404 on a path that looks like a vulnerability scan.
pub fn is_suspicious_miss(status: StatusCode, path: &str) -> bool {
    status == StatusCode::NOT_FOUND && SCANNER_PATH.is_match(path)
}

/// Outermost middleware: one log line per request with status and
/// duration.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let identity = client_identity(req.headers(), peer);
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let resp = next.run(req).await;
    let status = resp.status();
    let duration_ms = start.elapsed().as_millis() as u64;

    if is_suspicious_miss(status, &path) {
        tracing::warn!(%method, path = %path, identity = %identity, user_agent = %user_agent, "suspicious 404");
    } else if status.is_server_error() {
        tracing::error!(%method, path = %path, status = status.as_u16(), duration_ms, identity = %identity, "request failed");
    } else if status.is_client_error() {
        tracing::warn!(%method, path = %path, status = status.as_u16(), duration_ms, identity = %identity, "request rejected");
    } else {
        tracing::info!(%method, path = %path, status = status.as_u16(), duration_ms, identity = %identity, "request");
    }
    resp
}
