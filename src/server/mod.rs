pub mod connection;
pub mod handlers;
pub mod layout;
pub mod users;

pub use handlers::{dispatch, RequestContext};
pub use layout::{init_store, StoreLayout};
pub use users::{User, UserRegistry};

use crate::audit::AuditLog;
use crate::certs::{CertificateAuthority, CertificateMinter, CommandMinter, RcgenMinter};
use crate::config::ServerConfig;
use crate::store::JsonStore;
use crate::ticket::TicketCodec;
use crate::tls;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// 服务器状态（所有连接共享）
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub layout: StoreLayout,
    pub users: UserRegistry,
    /// 密文引用 id → 明文
    pub keys: JsonStore<String>,
    pub audit: AuditLog,
    pub tickets: TicketCodec,
    pub minter: Arc<dyn CertificateMinter>,
    /// 串行化用户创建：权限检查、签发与写入注册表之间不能插入另一个创建
    pub user_creation: tokio::sync::Mutex<()>,
}

impl ServerState {
    /// 按配置创建状态：选择签发方并执行启动前检查
    pub fn new(config: ServerConfig) -> Result<Self> {
        let layout = StoreLayout::new(&config.store_dir);
        let minter: Arc<dyn CertificateMinter> = match &config.minter {
            Some(cmd) => Arc::new(CommandMinter::new(
                cmd.program.clone(),
                cmd.args.clone(),
                layout.certs_dir(),
            )),
            None => {
                let ca = CertificateAuthority::load_or_create(
                    &layout.ca_cert(),
                    &layout.ca_key(),
                    &config.organization,
                )?;
                Arc::new(RcgenMinter::new(ca))
            }
        };
        Self::with_minter(config, minter)
    }

    /// 使用指定的签发方创建状态（用于测试）
    pub fn with_minter(config: ServerConfig, minter: Arc<dyn CertificateMinter>) -> Result<Self> {
        let layout = StoreLayout::new(&config.store_dir);
        layout.check()?;
        minter
            .preflight()
            .context("Certificate minter is not usable")?;

        let audit = AuditLog::open(
            layout.audit_file(),
            config.audit.max_size,
            config.audit.max_files,
        )?;
        let users = UserRegistry::open(layout.users_file());
        let keys = JsonStore::open(layout.keys_file());

        Ok(Self {
            config: Arc::new(config),
            layout,
            users,
            keys,
            audit,
            tickets: TicketCodec::new(),
            minter,
            user_creation: tokio::sync::Mutex::new(()),
        })
    }

    /// 将挂起的存储写入磁盘
    pub fn flush(&self) {
        if let Err(e) = self.users.flush() {
            error!("Failed to flush user registry: {}", e);
        }
        if let Err(e) = self.keys.flush() {
            error!("Failed to flush keystore: {}", e);
        }
    }
}

/// 运行服务器，直到收到 Ctrl+C
pub async fn run_server(config: ServerConfig) -> Result<()> {
    run_server_until(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// 运行服务器，直到 `shutdown` 完成
pub async fn run_server_until<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let state = Arc::new(ServerState::new(config)?);
    serve(state, shutdown).await
}

/// 在给定状态上接受连接
pub async fn serve<F>(state: Arc<ServerState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let tls_config = tls::load_server_config(
        &state.layout.server_cert(),
        &state.layout.server_key(),
    )?;
    let acceptor = TlsAcceptor::from(tls_config);

    let listen_addr = state.config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    info!(
        "Tunnel depot {} listening on {}{}",
        env!("CARGO_PKG_VERSION"),
        listen_addr,
        if state.config.read_only { " (read-only)" } else { "" }
    );
    if state.users.is_empty() {
        warn!("No users registered yet; the first user created becomes admin");
    }
    info!("Waiting for client connections... (Press Ctrl+C to stop)");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let acceptor = acceptor.clone();
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = connection::handle_connection(stream, peer, acceptor, state).await {
                                warn!("Connection from {} failed: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping server...");
                break;
            }
        }
    }

    state.flush();
    info!("Server stopped gracefully");
    Ok(())
}
