/// Tunnel Depot 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod audit;
pub mod certs;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod ranges;
pub mod server;
pub mod store;
pub mod ticket;
pub mod tls;
pub mod tunnel;
pub mod wire;

// 重新导出常用类型
pub use client::{ClientContext, PullReport, Registration, SyncClient};
pub use config::{AppConfig, ClientConfig, ServerConfig};
pub use error::{DepotError, Result};
pub use server::{run_server, ServerState};
pub use store::JsonStore;
pub use ticket::TicketCodec;
pub use tunnel::TunnelDefinition;
pub use wire::{DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE};
