/// 审计日志
///
/// 每行一条 JSON 记录，只追加；超过大小上限时轮转为 `audit.log.1` ... `audit.log.N`。
use crate::error::Result;
use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// 默认单文件上限 10MB
pub const DEFAULT_AUDIT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// 默认保留文件数（含当前文件）
pub const DEFAULT_AUDIT_MAX_FILES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
}

/// 一条审计记录
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// 毫秒时间戳
    pub time: u64,
    pub level: AuditLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl AuditRecord {
    pub fn new(level: AuditLevel, event: impl Into<String>) -> Self {
        Self {
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            level,
            event: event.into(),
            client: None,
            method: None,
            path: None,
            user: None,
            comment: None,
        }
    }

    pub fn info(event: impl Into<String>) -> Self {
        Self::new(AuditLevel::Info, event)
    }

    pub fn warning(event: impl Into<String>) -> Self {
        Self::new(AuditLevel::Warning, event)
    }

    pub fn client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client.to_string());
        self
    }

    /// 填充请求方信息
    pub fn request(mut self, client: SocketAddr, method: &str, path: &str) -> Self {
        self.client = Some(client.to_string());
        self.method = Some(method.to_string());
        self.path = Some(path.to_string());
        self
    }

    pub fn user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(str::to_string);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

struct AuditFile {
    file: File,
    size: u64,
}

pub struct AuditLog {
    path: PathBuf,
    max_size: u64,
    max_files: usize,
    inner: Mutex<AuditFile>,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>, max_size: u64, max_files: usize) -> Result<Self> {
        let path = path.into();
        let inner = Mutex::new(open_append(&path)?);
        let log = Self {
            path,
            max_size: max_size.max(1),
            max_files: max_files.max(1),
            inner,
        };
        log.record(&AuditRecord::info("audit started"))?;
        info!("Audit log at {:?}", log.path);
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条记录，必要时先轮转
    pub fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut current = self.inner.lock();
        if current.size > 0 && current.size + line.len() as u64 > self.max_size {
            drop(std::mem::replace(&mut *current, self.rotate()?));
        }

        current
            .file
            .write_all(&line)
            .with_context(|| format!("Failed to append to audit log {:?}", self.path))?;
        current.size += line.len() as u64;
        Ok(())
    }

    fn numbered(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&self) -> Result<AuditFile> {
        if self.max_files > 1 {
            let oldest = self.numbered(self.max_files - 1);
            if oldest.exists() {
                std::fs::remove_file(&oldest)
                    .with_context(|| format!("Failed to remove {:?}", oldest))?;
            }
            for n in (1..self.max_files - 1).rev() {
                let from = self.numbered(n);
                if from.exists() {
                    std::fs::rename(&from, self.numbered(n + 1))
                        .with_context(|| format!("Failed to rotate {:?}", from))?;
                }
            }
            std::fs::rename(&self.path, self.numbered(1))
                .with_context(|| format!("Failed to rotate {:?}", self.path))?;
        } else {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to truncate {:?}", self.path))?;
        }
        open_append(&self.path)
    }
}

fn open_append(path: &Path) -> Result<AuditFile> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open audit log {:?}", path))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok(AuditFile { file, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_records_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path, DEFAULT_AUDIT_MAX_SIZE, DEFAULT_AUDIT_MAX_FILES).unwrap();

        let client: SocketAddr = "192.0.2.4:5555".parse().unwrap();
        log.record(
            &AuditRecord::warning("unknown token")
                .request(client, "GET", "/register/abc")
                .comment("no such token"),
        )
        .unwrap();

        let entries = lines(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event"], "audit started");
        assert_eq!(entries[1]["level"], "warning");
        assert_eq!(entries[1]["client"], "192.0.2.4:5555");
        assert!(entries[1].get("user").is_none());
    }

    #[test]
    fn test_record_without_request_line() {
        let client: SocketAddr = "192.0.2.4:5555".parse().unwrap();
        let json = serde_json::to_value(
            AuditRecord::warning("malformed request")
                .client(client)
                .comment("HTTP/2 handshake failed"),
        )
        .unwrap();
        assert_eq!(json["client"], "192.0.2.4:5555");
        assert!(json.get("method").is_none());
        assert!(json.get("path").is_none());
    }

    #[test]
    fn test_rotation_keeps_bounded_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path, 200, 3).unwrap();

        for i in 0..40 {
            log.record(&AuditRecord::info(format!("event number {}", i)))
                .unwrap();
        }

        assert!(path.exists());
        assert!(dir.path().join("audit.log.1").exists());
        assert!(dir.path().join("audit.log.2").exists());
        assert!(!dir.path().join("audit.log.3").exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 200);

        let last = lines(&path);
        assert_eq!(last.last().unwrap()["event"], "event number 39");
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        drop(AuditLog::open(&path, DEFAULT_AUDIT_MAX_SIZE, 2).unwrap());
        drop(AuditLog::open(&path, DEFAULT_AUDIT_MAX_SIZE, 2).unwrap());
        assert_eq!(lines(&path).len(), 2);
    }
}
