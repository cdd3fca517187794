use super::SyncClient;
use crate::error::{DepotError, Result};
use crate::protocol::ManifestEntry;
use crate::tunnel;
use futures::future::join_all;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// 一次 pull 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// 已下载的文件名
    pub fetched: Vec<String>,
    /// 本地已是最新的文件数
    pub unchanged: usize,
}

impl PullReport {
    pub fn total(&self) -> usize {
        self.fetched.len() + self.unchanged
    }
}

/// 判断清单条目是否需要下载
///
/// 本地文件不存在时总是下载；有哈希时只比较哈希，旧服务器的清单没有哈希时才按秒比较修改时间。
/// 旧服务器的 sha1 摘要无法与本地的 sha256 比较，同样按修改时间处理。
pub async fn needs_fetch(entry: &ManifestEntry, local: &Path) -> Result<bool> {
    let meta = match tokio::fs::metadata(local).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    let comparable = entry
        .hash
        .as_deref()
        .filter(|hash| hash.len() == tunnel::CONTENT_HASH_LEN);
    match comparable {
        Some(hash) => {
            let data = tokio::fs::read(local).await?;
            Ok(!tunnel::content_hash(&data).eq_ignore_ascii_case(hash))
        }
        None => {
            let local_secs = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            Ok(local_secs != entry.mtime / 1000)
        }
    }
}

/// 将文件修改时间设置为服务器记录的时间（毫秒截断为秒）
fn set_mtime(path: &Path, mtime_ms: u64) -> Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime_ms / 1000))?;
    Ok(())
}

impl SyncClient {
    async fn fetch_entry(&self, entry: &ManifestEntry, dir: &Path) -> Result<()> {
        let local = dir.join(&entry.name);
        self.save_bin(&format!("/store/{}", entry.name), &local)
            .await?;
        set_mtime(&local, entry.mtime)
    }

    /// 将服务器上的定义同步到本地目录
    ///
    /// 所有下载并发进行，并且全部结束后才返回；任一下载失败时返回第一个错误。
    pub async fn pull(&self, dir: &Path) -> Result<PullReport> {
        tokio::fs::create_dir_all(dir).await?;
        let manifest = self.list().await?;

        let mut report = PullReport::default();
        let mut stale = Vec::new();
        for entry in manifest {
            if !tunnel::is_valid_file_name(&entry.name) {
                warn!("Ignoring manifest entry with unsafe name {:?}", entry.name);
                continue;
            }
            if let Some(reason) = &entry.error {
                warn!("{} does not parse on the server: {}", entry.name, reason);
            }
            if needs_fetch(&entry, &dir.join(&entry.name)).await? {
                stale.push(entry);
            } else {
                debug!("{} is up to date", entry.name);
                report.unchanged += 1;
            }
        }

        let results = join_all(stale.iter().map(|entry| self.fetch_entry(entry, dir))).await;

        let mut first_error: Option<DepotError> = None;
        for (entry, result) in stale.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!("Fetched {}", entry.name);
                    report.fetched.push(entry.name);
                }
                Err(e) => {
                    error!("Failed to fetch {}: {}", entry.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!("{} tunnel definitions in sync", report.total());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, mtime: u64, hash: Option<String>) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            mtime,
            hash,
            summary: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_missing_local_file_is_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry("lab.ini", 1_700_000_000_000, Some("00".repeat(32)));
        assert!(needs_fetch(&e, &dir.path().join("lab.ini")).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_takes_precedence_over_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.ini");
        std::fs::write(&path, b"[general]\n").unwrap();
        let hash = tunnel::content_hash(b"[general]\n");

        // 修改时间不同但哈希相同：不下载
        let same = entry("lab.ini", 1_000, Some(hash.to_uppercase()));
        assert!(!needs_fetch(&same, &path).await.unwrap());

        // 修改时间相同但哈希不同：下载
        set_mtime(&path, 1_700_000_000_999).unwrap();
        let differs = entry("lab.ini", 1_700_000_000_999, Some("11".repeat(32)));
        assert!(needs_fetch(&differs, &path).await.unwrap());
    }

    #[tokio::test]
    async fn test_mtime_fallback_compares_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.ini");
        std::fs::write(&path, b"x").unwrap();
        set_mtime(&path, 1_600_000_000_500).unwrap();

        assert!(!needs_fetch(&entry("old.ini", 1_600_000_000_900, None), &path)
            .await
            .unwrap());
        assert!(needs_fetch(&entry("old.ini", 1_600_000_001_000, None), &path)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_legacy_sha1_uses_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.ini");
        std::fs::write(&path, b"x").unwrap();
        set_mtime(&path, 1_600_000_000_000).unwrap();

        let sha1 = Some("da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string());
        assert!(!needs_fetch(&entry("old.ini", 1_600_000_000_000, sha1.clone()), &path)
            .await
            .unwrap());
        assert!(needs_fetch(&entry("old.ini", 1_700_000_000_000, sha1), &path)
            .await
            .unwrap());
    }

    #[test]
    fn test_report_total() {
        let report = PullReport {
            fetched: vec!["a.ini".to_string()],
            unchanged: 2,
        };
        assert_eq!(report.total(), 3);
    }
}
