use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{
    default_bind_addr, default_common_name, default_max_body_size, default_organization,
    validator::ConfigValidator, AuditConfig, MinterConfig, ServerConfig, DEFAULT_PORT,
};

/// ServerConfig Builder
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    store_dir: Option<PathBuf>,
    read_only: bool,
    common_name: Option<String>,
    alt_names: Vec<String>,
    minter: Option<MinterConfig>,
    audit: Option<AuditConfig>,
}

impl ServerConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置绑定地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// 设置绑定端口
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    /// 设置存储目录
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// 设置服务器证书名称
    pub fn common_name(mut self, name: impl Into<String>) -> Self {
        self.common_name = Some(name.into());
        self
    }

    pub fn alt_name(mut self, name: impl Into<String>) -> Self {
        self.alt_names.push(name.into());
        self
    }

    /// 使用外部签发程序
    pub fn minter(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.minter = Some(MinterConfig {
            program: program.into(),
            args,
        });
        self
    }

    pub fn audit(mut self, max_size: u64, max_files: usize) -> Self {
        self.audit = Some(AuditConfig {
            max_size,
            max_files,
        });
        self
    }

    /// 构建 ServerConfig 并验证
    pub fn build(self) -> Result<ServerConfig> {
        let config = ServerConfig {
            bind_addr: self.bind_addr.unwrap_or_else(default_bind_addr),
            bind_port: self.bind_port.unwrap_or(DEFAULT_PORT),
            store_dir: self.store_dir.context("store_dir is required")?,
            read_only: self.read_only,
            common_name: self.common_name.unwrap_or_else(default_common_name),
            alt_names: self.alt_names,
            organization: default_organization(),
            max_body_size: default_max_body_size(),
            minter: self.minter,
            audit: self.audit.unwrap_or_default(),
        };

        ConfigValidator::validate_server_config(&config)?;
        Ok(config)
    }
}
