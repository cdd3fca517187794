/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误分类，调用方可以据此决定如何处理：
/// 格式/校验错误在任何副作用之前返回，传输错误在客户端一律视为致命。
use std::io;
use thiserror::Error;

/// Tunnel Depot 的主要错误类型
#[derive(Error, Debug)]
pub enum DepotError {
    /// 隧道定义文本格式错误（含不支持的版本）
    #[error("Format error: {0}")]
    Format(String),

    /// 格式正确但语义无效
    #[error("Validation error: {0}")]
    Validation(String),

    /// 文件、用户或令牌不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 认证或授权失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 客户端与服务器协议版本不匹配
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 网络或 TLS 错误
    #[error("Transport error: {0}")]
    Transport(String),

    /// 服务器证书指纹与注册时固定的指纹不一致
    #[error("Transport error: server fingerprint mismatch (expected {expected}, got {actual})")]
    FingerprintMismatch { expected: String, actual: String },

    /// 服务器返回了非 200 的状态码
    #[error("Server responded with {status}: {message}")]
    Http { status: u16, message: String },

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON 编解码错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, DepotError>;

impl From<h2::Error> for DepotError {
    fn from(err: h2::Error) -> Self {
        Self::Transport(format!("HTTP/2 error: {}", err))
    }
}

impl DepotError {
    /// 创建格式错误
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// 创建校验错误
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 按服务器响应状态码映射错误类别
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            403 => Self::Auth(message),
            404 => Self::NotFound(message),
            426 => Self::Protocol(message),
            _ => Self::Http { status, message },
        }
    }

    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// 检查是否为传输层错误（指纹不匹配和超时也归为此类）
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::FingerprintMismatch { .. } | Self::Timeout { .. }
        )
    }

    pub fn is_fingerprint_mismatch(&self) -> bool {
        matches!(self, Self::FingerprintMismatch { .. })
    }
}
