/// Common utilities for integration tests
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tunnel_depot::client::{ClientContext, Registration, SyncClient};
use tunnel_depot::config::ServerConfig;
use tunnel_depot::server;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Wait for server to be ready
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// A depot server running on a scratch store; stopped on drop
pub struct TestDepot {
    pub port: u16,
    pub fingerprint: String,
    pub config: ServerConfig,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl TestDepot {
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    pub async fn start_with(read_only: bool) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create store dir");
        let port = get_available_port();
        let config = ServerConfig::builder()
            .bind_addr("127.0.0.1")
            .bind_port(port)
            .store_dir(dir.path().join("store"))
            .common_name("localhost")
            .alt_name("127.0.0.1")
            .read_only(read_only)
            .build()
            .expect("Failed to build server config");

        let fingerprint = server::init_store(&config).expect("Failed to initialize store");

        let (tx, rx) = oneshot::channel::<()>();
        let server_config = config.clone();
        let handle = tokio::spawn(async move {
            server::run_server_until(server_config, async {
                let _ = rx.await;
            })
            .await
            .expect("Server failed");
        });

        assert!(wait_for_server(port, 50).await, "Server did not start");

        Self {
            port,
            fingerprint,
            config,
            shutdown: Some(tx),
            handle: Some(handle),
            _dir: dir,
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.config.store_dir
    }

    pub fn data_dir(&self) -> PathBuf {
        self.store_dir().join("data")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.store_dir().join("backup")
    }

    /// Context pinned to this server, without a client certificate
    pub fn context(&self) -> ClientContext {
        ClientContext::new("127.0.0.1", self.port)
            .with_fingerprint(self.fingerprint.clone())
            .with_timeout(Duration::from_secs(10))
    }

    pub fn anonymous(&self) -> SyncClient {
        SyncClient::new(self.context()).expect("Failed to create client")
    }

    pub fn client_for(&self, registration: &Registration) -> SyncClient {
        let ctx = self
            .context()
            .with_identity(registration.cert.clone(), registration.key.clone());
        SyncClient::new(ctx).expect("Failed to create client")
    }

    /// Create `name` through `creator` and redeem the returned token
    pub async fn enroll_registration(
        &self,
        creator: &SyncClient,
        name: &str,
        admin: bool,
    ) -> Registration {
        let user = creator
            .new_user(name, admin)
            .await
            .expect("Failed to create user");
        let token = user.token.expect("New user has no token");
        let registration = self
            .anonymous()
            .register(&token)
            .await
            .expect("Failed to register");
        assert_eq!(registration.fingerprint, self.fingerprint);
        registration
    }

    pub async fn enroll(&self, creator: &SyncClient, name: &str, admin: bool) -> SyncClient {
        let registration = self.enroll_registration(creator, name, admin).await;
        self.client_for(&registration)
    }

    /// Stop the server and wait for the stores to be flushed
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestDepot {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// A minimal valid tunnel definition
pub fn sample_definition(description: &str) -> String {
    format!(
        "[general]\n\
         version = 3.2\n\
         author = ops\n\
         description = {}\n\
         main = gw\n\
         \n\
         [hosts.gw]\n\
         addr = 192.0.2.10\n\
         user = admin\n\
         password = hunter2\n\
         \n\
         [forwards.web]\n\
         127.0.0.1:3000-3002 = 10.0.0.5\n",
        description
    )
}
