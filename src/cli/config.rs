use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::certs::write_private;
use crate::client::{ClientContext, Registration, SyncClient};
use crate::config::{AppConfig, ClientConfig};

/// 客户端目录下的配置文件名
pub const CLIENT_CONFIG_FILE: &str = "client.toml";

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for {:?}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户或组用户可读（o+r = 0o004, g+r = 0o040）
    if mode & 0o044 != 0 {
        warn!(
            "⚠️  SECURITY WARNING: '{}' is readable by group or others (permissions: {:o})\n\
             RECOMMENDATION: chmod 600 {}",
            config_path.display(),
            mode & 0o777,
            config_path.display()
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &Path) -> Result<()> {
    Ok(())
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(path_buf)
    } else {
        Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path_buf))
    }
}

/// 已注册的客户端：配置文件及其所在目录
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub base: PathBuf,
    pub config: ClientConfig,
}

impl ClientProfile {
    /// 从客户端目录加载
    pub fn load(dir: &str) -> Result<Self> {
        let base = expand_path(dir)?;
        let config_path = base.join(CLIENT_CONFIG_FILE);
        if !config_path.exists() {
            anyhow::bail!(
                "{:?} not found; run `tunnel-depot register <server> <token>` first",
                config_path
            );
        }
        let config = AppConfig::load_client_config(&config_path)?;
        check_config_file_permissions(&config.key_path(&base))?;
        Ok(Self { base, config })
    }

    pub fn tunnels_dir(&self) -> PathBuf {
        self.config.tunnels_dir(&self.base)
    }

    /// 构造同步客户端（携带证书与固定指纹）
    pub fn client(&self) -> Result<SyncClient> {
        let ctx = ClientContext::from_config(&self.config, &self.base)?;
        if ctx.identity.is_none() {
            anyhow::bail!(
                "No client certificate in {:?}; register this machine first",
                self.base
            );
        }
        Ok(SyncClient::new(ctx)?)
    }
}

/// 保存注册结果：证书、私钥（0600）以及固定了服务器指纹的配置
pub fn save_registration(
    base: &Path,
    host: &str,
    port: u16,
    registration: &Registration,
) -> Result<ClientConfig> {
    std::fs::create_dir_all(base).with_context(|| format!("Failed to create {:?}", base))?;

    let mut config = ClientConfig::new(host, port);
    config.server.fingerprint = Some(registration.fingerprint.clone());

    let cert_path = config.cert_path(base);
    std::fs::write(&cert_path, &registration.cert)
        .with_context(|| format!("Failed to write {:?}", cert_path))?;
    write_private(&config.key_path(base), &registration.key)?;
    std::fs::create_dir_all(config.tunnels_dir(base))?;

    AppConfig::save_client_config(&base.join(CLIENT_CONFIG_FILE), &config)?;
    Ok(config)
}
