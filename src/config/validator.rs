use anyhow::{bail, Result};
use tracing::warn;

use super::{AuditConfig, ClientConfig, MinterConfig, ServerConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证指纹格式：64 位十六进制
    pub fn validate_fingerprint(fingerprint: &str) -> Result<()> {
        if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!(
                "fingerprint must be 64 hexadecimal characters (got {:?})",
                fingerprint
            );
        }
        Ok(())
    }

    pub fn validate_minter_config(config: &MinterConfig) -> Result<()> {
        if config.program.trim().is_empty() {
            bail!("minter.program cannot be empty");
        }
        Ok(())
    }

    pub fn validate_audit_config(config: &AuditConfig) -> Result<()> {
        if config.max_size == 0 {
            bail!("audit.max_size must be greater than 0");
        }
        if config.max_files == 0 {
            bail!("audit.max_files must be greater than 0");
        }
        if config.max_size < 1024 {
            warn!(
                "audit.max_size ({}) is very small, the audit log will rotate on almost every request",
                config.max_size
            );
        }
        Ok(())
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "Server bind_addr")?;
        Self::validate_port(config.bind_port, "Server bind_port")?;

        if config.store_dir.as_os_str().is_empty() {
            bail!("store_dir cannot be empty");
        }
        if config.common_name.trim().is_empty() {
            bail!("common_name cannot be empty");
        }
        if config.max_body_size == 0 {
            bail!("max_body_size must be greater than 0");
        }

        if let Some(ref minter) = config.minter {
            Self::validate_minter_config(minter)?;
        }
        Self::validate_audit_config(&config.audit)?;

        Ok(())
    }

    /// 验证客户端配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        Self::validate_address(&config.server.host, "Client server.host")?;
        Self::validate_port(config.server.port, "Client server.port")?;

        if let Some(ref fingerprint) = config.server.fingerprint {
            Self::validate_fingerprint(fingerprint)?;
        }
        if config.client.timeout_secs == 0 {
            bail!("client.timeout_secs must be greater than 0");
        }
        Ok(())
    }
}
