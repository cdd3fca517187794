//! On-disk layout of the server store directory.

use crate::certs::CertificateAuthority;
use crate::config::ServerConfig;
use crate::tls;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// 服务器存储目录
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn users_file(&self) -> PathBuf {
        self.root.join("users.json")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn keys_file(&self) -> PathBuf {
        self.data_dir().join("keys.json")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn extra_dir(&self) -> PathBuf {
        self.root.join("extra")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.certs_dir().join("ca.crt")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.certs_dir().join("ca.key")
    }

    pub fn server_cert(&self) -> PathBuf {
        self.certs_dir().join("server.crt")
    }

    pub fn server_key(&self) -> PathBuf {
        self.certs_dir().join("server.key")
    }

    pub fn user_cert(&self, name: &str) -> PathBuf {
        self.certs_dir().join(format!("{}.crt", name))
    }

    pub fn user_key(&self, name: &str) -> PathBuf {
        self.certs_dir().join(format!("{}.key", name))
    }

    /// 存储的定义文件路径
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir().join(name)
    }

    /// 检查服务器启动所需的文件是否齐全
    pub fn check(&self) -> Result<()> {
        for dir in [self.certs_dir(), self.data_dir(), self.backup_dir()] {
            if !dir.is_dir() {
                anyhow::bail!(
                    "Store directory {:?} is not initialized (missing {:?}); run init-store first",
                    self.root,
                    dir
                );
            }
        }
        for file in [self.server_cert(), self.server_key()] {
            if !file.is_file() {
                anyhow::bail!("Server certificate {:?} is missing; run init-store first", file);
            }
        }
        Ok(())
    }
}

/// 初始化存储目录：创建子目录、CA 与服务器证书
///
/// 已存在的证书不会被覆盖。返回服务器证书指纹。
pub fn init_store(config: &ServerConfig) -> Result<String> {
    let layout = StoreLayout::new(&config.store_dir);

    for dir in [
        layout.root().to_path_buf(),
        layout.certs_dir(),
        layout.data_dir(),
        layout.backup_dir(),
        layout.extra_dir(),
    ] {
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    if config.minter.is_none() {
        CertificateAuthority::load_or_create(
            &layout.ca_cert(),
            &layout.ca_key(),
            &config.organization,
        )?;
    }

    let fingerprint = if layout.server_cert().is_file() && layout.server_key().is_file() {
        let pem = std::fs::read_to_string(layout.server_cert())
            .with_context(|| format!("Failed to read {:?}", layout.server_cert()))?;
        tls::fingerprint_pem(&pem)?
    } else {
        let fingerprint = tls::generate_self_signed_cert(
            &config.common_name,
            &config.alt_names,
            &layout.server_cert(),
            &layout.server_key(),
        )?;
        info!("Generated server certificate {:?}", layout.server_cert());
        fingerprint
    };

    info!("Initialized store directory {:?}", layout.root());
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = StoreLayout::new("/srv/depot");
        assert_eq!(layout.keys_file(), PathBuf::from("/srv/depot/data/keys.json"));
        assert_eq!(layout.user_cert("alice"), PathBuf::from("/srv/depot/certs/alice.crt"));
        assert_eq!(layout.audit_file(), PathBuf::from("/srv/depot/audit.log"));
    }

    #[test]
    fn test_init_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::builder()
            .store_dir(dir.path().join("store"))
            .build()
            .unwrap();

        let layout = StoreLayout::new(&config.store_dir);
        assert!(layout.check().is_err());

        let first = init_store(&config).unwrap();
        let second = init_store(&config).unwrap();
        assert_eq!(first, second);

        layout.check().unwrap();
        assert!(layout.ca_cert().is_file());
        assert!(layout.extra_dir().is_dir());
    }

    #[test]
    fn test_init_store_with_external_minter_skips_ca() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::builder()
            .store_dir(dir.path())
            .minter("mint-cert", vec![])
            .build()
            .unwrap();

        init_store(&config).unwrap();
        assert!(!StoreLayout::new(dir.path()).ca_cert().exists());
    }
}
