use crate::config::DEFAULT_PORT;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tunnel-depot")]
#[command(author, version, about = "Mutual-TLS depot for SSH tunnel definitions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// 客户端目录（配置、证书与本地定义）
    #[arg(short, long, default_value = "~/.tunnel-depot", global = true)]
    pub dir: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行服务器
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 初始化服务器存储目录与证书
    InitStore {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 使用一次性令牌向服务器注册本机
    Register {
        /// 服务器主机名
        server: String,
        /// 注册令牌
        token: String,
        /// 服务器端口
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// 从服务器同步隧道定义
    Pull,
    /// 上传隧道定义文件
    Push {
        /// 定义文件路径
        file: String,
    },
    /// 列出服务器上的隧道定义
    List,
    /// 生成新的注册令牌（用于另一台机器）
    Token,
    /// 创建用户（首个用户自动成为管理员）
    Newuser {
        name: String,
        /// 授予管理员权限
        #[arg(long)]
        admin: bool,
    },
    /// 删除用户
    Deluser { name: String },
    /// 列出用户
    Lsusers,
    /// 删除服务器上的隧道定义
    Delete {
        /// 定义名（可省略 .ini）
        tunnel: String,
    },
    /// 导出本地定义并还原其中的密钥
    Export {
        /// 定义名（可省略 .ini）
        tunnel: String,
        /// 输出文件路径
        file: String,
    },
    /// 检查隧道定义文件
    Check {
        /// 定义文件路径
        file: String,
    },
    /// 申请一张短期票据
    Ticket,
    /// 显示本地与服务器版本
    Version,
}
