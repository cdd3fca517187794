pub mod connection;
pub mod pull;

pub use connection::{exchange, Exchange};
pub use pull::PullReport;

use crate::config::{ClientConfig, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS};
use crate::error::{DepotError, Result};
use crate::protocol::{
    Enrollment, KeyReply, ManifestEntry, PackageInfo, StoreReply, TicketReply, TicketStatus,
    TokenReply,
};
use crate::server::User;
use crate::tls;
use crate::tunnel::{self, KeyResolver, TunnelDefinition};
use crate::wire::{Request, Response, PROTOCOL_VERSION, TICKET_HEADER, VERSION_HEADER};
use anyhow::Context;
use async_trait::async_trait;
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// 客户端证书与私钥（PEM）
#[derive(Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").finish_non_exhaustive()
    }
}

/// 所有请求共享的调用参数，启动时构造一次
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub host: String,
    pub port: u16,
    pub identity: Option<Identity>,
    /// 注册时固定的服务器证书指纹
    pub fingerprint: Option<String>,
    pub timeout: Duration,
}

impl ClientContext {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            identity: None,
            fingerprint: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_identity(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.identity = Some(Identity {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        });
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 从客户端配置构造；证书和私钥存在时一并加载
    pub fn from_config(config: &ClientConfig, base: &Path) -> anyhow::Result<Self> {
        let mut ctx = Self::new(config.server.host.clone(), config.server.port)
            .with_timeout(Duration::from_secs(config.client.timeout_secs));
        ctx.fingerprint = config.server.fingerprint.clone();

        let cert_path = config.cert_path(base);
        let key_path = config.key_path(base);
        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)
                .with_context(|| format!("Failed to read client certificate {:?}", cert_path))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .with_context(|| format!("Failed to read client key {:?}", key_path))?;
            ctx = ctx.with_identity(cert_pem, key_pem);
        }
        Ok(ctx)
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

/// 注册结果
#[derive(Debug, Clone)]
pub struct Registration {
    pub cert: String,
    pub key: String,
    /// 握手时观察到的服务器证书指纹，供后续固定
    pub fingerprint: String,
}

/// 同步客户端
#[derive(Clone)]
pub struct SyncClient {
    ctx: Arc<ClientContext>,
    tls_config: Arc<rustls::ClientConfig>,
}

impl SyncClient {
    pub fn new(ctx: ClientContext) -> Result<Self> {
        let identity = ctx
            .identity
            .as_ref()
            .map(|id| (id.cert_pem.as_str(), id.key_pem.as_str()));
        let tls_config = tls::load_client_config(identity, ctx.fingerprint.as_deref())?;
        Ok(Self {
            ctx: Arc::new(ctx),
            tls_config,
        })
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    async fn send(&self, request: Request) -> Result<Exchange> {
        let request = request.with_header(VERSION_HEADER, PROTOCOL_VERSION)?;
        exchange(&self.ctx, Arc::clone(&self.tls_config), &request).await
    }

    /// 发送请求；非 200 响应映射为对应的错误
    async fn call(&self, request: Request) -> Result<Response> {
        let response = self.send(request).await?.response;
        check_status(response)
    }

    async fn call_json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let response = self.call(request).await?;
        if response.body.is_empty() {
            return Err(DepotError::protocol("server returned an empty response"));
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// 获取服务器清单
    pub async fn list(&self) -> Result<Vec<ManifestEntry>> {
        self.call_json(Request::new(Method::GET, "/store")).await
    }

    /// 下载一个定义文件的原始内容
    pub async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        let response = self
            .call(Request::new(Method::GET, &format!("/store/{}", name)))
            .await?;
        Ok(response.body)
    }

    /// 下载到本地文件
    ///
    /// 先写入 `.part` 临时文件，落盘并关闭后再改名，返回时文件已完整可见。
    pub async fn save_bin(&self, target: &str, local: &Path) -> Result<u64> {
        let response = self.call(Request::new(Method::GET, target)).await?;

        let mut part = local.as_os_str().to_owned();
        part.push(".part");
        let part = std::path::PathBuf::from(part);

        let mut file = tokio::fs::File::create(&part).await?;
        file.write_all(&response.body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&part, local).await?;
        debug!("Saved {} bytes to {:?}", response.body.len(), local);
        Ok(response.body.len() as u64)
    }

    /// 上传定义文件；文件名策略与格式校验都在联网之前完成
    pub async fn push(&self, path: &Path) -> Result<StoreReply> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !tunnel::is_valid_file_name(&name) {
            return Err(DepotError::validation(format!(
                "{:?} is not an acceptable definition file name (use [0-9a-z_.-] and .ini)",
                name
            )));
        }
        tunnel::load_file(path)?;

        let body = tokio::fs::read(path).await?;
        let reply: StoreReply = self
            .call_json(Request::new(Method::PUT, &format!("/store/{}", name)).with_body(body))
            .await?;
        info!("Pushed {} ({} bytes)", name, reply.length);
        Ok(reply)
    }

    /// 用一次性令牌换取客户端证书
    pub async fn register(&self, token: &str) -> Result<Registration> {
        let exchange = self
            .send(Request::new(Method::GET, &format!("/register/{}", token)))
            .await?;
        let fingerprint = exchange.server_fingerprint;
        let response = check_status(exchange.response)?;
        let enrollment: Enrollment = serde_json::from_slice(&response.body)?;
        Ok(Registration {
            cert: enrollment.cert,
            key: enrollment.key,
            fingerprint,
        })
    }

    /// 为当前用户生成新的注册令牌（旧令牌失效）
    pub async fn new_token(&self) -> Result<String> {
        let reply: TokenReply = self.call_json(Request::new(Method::POST, "/newtoken")).await?;
        Ok(reply.token)
    }

    pub async fn new_user(&self, name: &str, admin: bool) -> Result<User> {
        let target = if admin {
            format!("/users/{}?admin=true", name)
        } else {
            format!("/users/{}", name)
        };
        self.call_json(Request::new(Method::POST, &target)).await
    }

    pub async fn delete_user(&self, name: &str) -> Result<()> {
        self.call(Request::new(Method::DELETE, &format!("/users/{}", name)))
            .await?;
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.call_json(Request::new(Method::GET, "/users")).await
    }

    /// 删除服务器上的定义（服务器会先备份）
    pub async fn delete_definition(&self, name: &str) -> Result<()> {
        let name = if name.ends_with(".ini") {
            name.to_string()
        } else {
            format!("{}.ini", name)
        };
        self.call(Request::new(Method::DELETE, &format!("/store/{}", name)))
            .await?;
        Ok(())
    }

    pub async fn get_key(&self, id: &str) -> Result<String> {
        let reply: KeyReply = self
            .call_json(Request::new(Method::GET, &format!("/key/{}", id)))
            .await?;
        Ok(reply.key)
    }

    /// 将定义中的密文引用替换为明文
    pub async fn unveil(&self, def: &mut TunnelDefinition) -> Result<usize> {
        tunnel::unveil(def, self).await
    }

    pub async fn issue_ticket(&self) -> Result<String> {
        let reply: TicketReply = self.call_json(Request::new(Method::POST, "/ticket")).await?;
        Ok(reply.ticket)
    }

    pub async fn examine_ticket(&self, ticket: &str) -> Result<TicketStatus> {
        let request = Request::new(Method::GET, "/ticket").with_header(TICKET_HEADER, ticket)?;
        self.call_json(request).await
    }

    pub async fn package_info(&self) -> Result<PackageInfo> {
        self.call_json(Request::new(Method::GET, "/pkg")).await
    }

    /// 下载附加文件
    pub async fn extra(&self, name: &str, local: &Path) -> Result<u64> {
        self.save_bin(&format!("/extra/{}", name), local).await
    }
}

#[async_trait]
impl KeyResolver for SyncClient {
    async fn resolve(&self, id: &str) -> Result<String> {
        self.get_key(id).await
    }
}

fn check_status(response: Response) -> Result<Response> {
    if response.status == StatusCode::OK {
        Ok(response)
    } else {
        Err(DepotError::from_status(
            response.status.as_u16(),
            response.error_message(),
        ))
    }
}
