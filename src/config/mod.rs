// 配置管理模块

mod builder;
mod validator;

pub use builder::ServerConfigBuilder;
pub use validator::ConfigValidator;

use crate::audit::{DEFAULT_AUDIT_MAX_FILES, DEFAULT_AUDIT_MAX_SIZE};
use crate::wire::DEFAULT_MAX_BODY_SIZE;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 默认服务端口
pub const DEFAULT_PORT: u16 = 9443;

/// 客户端默认请求超时（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_common_name() -> String {
    "localhost".to_string()
}

fn default_organization() -> String {
    "Tunnel Depot".to_string()
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// 外部证书签发程序
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinterConfig {
    /// 程序路径或 PATH 中的名称
    pub program: String,
    /// 在身份名和输出目录之前传入的参数
    #[serde(default)]
    pub args: Vec<String>,
}

/// 审计日志轮转配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    pub max_size: u64,
    pub max_files: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_AUDIT_MAX_SIZE,
            max_files: DEFAULT_AUDIT_MAX_FILES,
        }
    }
}

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 服务器监听端口
    #[serde(default = "default_port")]
    pub bind_port: u16,
    /// 存储根目录
    pub store_dir: PathBuf,
    /// 只读模式：拒绝所有写操作
    #[serde(default)]
    pub read_only: bool,
    /// 服务器证书 CN
    #[serde(default = "default_common_name")]
    pub common_name: String,
    /// 服务器证书附加名称
    #[serde(default)]
    pub alt_names: Vec<String>,
    /// CA 的组织名
    #[serde(default = "default_organization")]
    pub organization: String,
    /// 最大请求体大小（字节）
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// 外部签发程序；未设置时使用内置 CA
    #[serde(default)]
    pub minter: Option<MinterConfig>,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl ServerConfig {
    /// 创建 Builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}

/// 客户端记录的服务器信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServer {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 注册时固定的服务器证书指纹
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// 客户端本地设置，路径相对于配置文件所在目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnels_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            tunnels_dir: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// 客户端配置（`client.toml`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: RemoteServer,
    #[serde(default)]
    pub client: ClientSettings,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            server: RemoteServer {
                host: host.into(),
                port,
                fingerprint: None,
            },
            client: ClientSettings::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_config(self)
    }

    fn resolve(base: &Path, configured: &Option<PathBuf>, default: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => base.join(path),
            None => base.join(default),
        }
    }

    /// 客户端证书路径
    pub fn cert_path(&self, base: &Path) -> PathBuf {
        Self::resolve(base, &self.client.cert_path, "client.crt")
    }

    /// 客户端私钥路径
    pub fn key_path(&self, base: &Path) -> PathBuf {
        Self::resolve(base, &self.client.key_path, "client.key")
    }

    /// 本地隧道定义目录
    pub fn tunnels_dir(&self, base: &Path) -> PathBuf {
        Self::resolve(base, &self.client.tunnels_dir, "tunnels")
    }
}

/// 配置文件读写入口
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载服务器配置（`[server]` 表）
    pub fn load_server_config(path: &Path) -> anyhow::Result<ServerConfig> {
        #[derive(Deserialize)]
        struct ServerConfigWrapper {
            server: ServerConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let wrapper: ServerConfigWrapper =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: &Path) -> anyhow::Result<ClientConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: ClientConfig =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 写回客户端配置
    pub fn save_client_config(path: &Path, config: &ClientConfig) -> anyhow::Result<()> {
        let content =
            toml::to_string_pretty(config).context("Failed to serialize client configuration")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}
