use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::client::{ClientContext, SyncClient};
use crate::config::AppConfig;
use crate::protocol::ManifestEntry;
use crate::{server, tunnel};

use super::config::{check_config_file_permissions, expand_path, save_registration, ClientProfile};
use super::{Cli, Commands};

/// Execute CLI commands
pub async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Server { config } => run_server(config).await?,
        Commands::InitStore { config } => init_store(config)?,
        Commands::Register {
            server,
            token,
            port,
        } => register(&cli.dir, server, token, *port).await?,
        Commands::Pull => {
            let profile = ClientProfile::load(&cli.dir)?;
            let report = profile.client()?.pull(&profile.tunnels_dir()).await?;
            println!(
                "✓ {} fetched, {} unchanged",
                report.fetched.len(),
                report.unchanged
            );
        }
        Commands::Push { file } => {
            let client = ClientProfile::load(&cli.dir)?.client()?;
            let path = expand_path(file)?;
            let reply = client.push(&path).await?;
            println!("✓ Pushed {} ({} bytes)", path.display(), reply.length);
        }
        Commands::List => {
            let client = ClientProfile::load(&cli.dir)?.client()?;
            print_manifest(&client.list().await?);
        }
        Commands::Token => {
            let client = ClientProfile::load(&cli.dir)?.client()?;
            let token = client.new_token().await?;
            println!("✓ New registration token: {}", token);
            println!("  Previous tokens are no longer valid.");
        }
        Commands::Newuser { name, admin } => new_user(&cli.dir, name, *admin).await?,
        Commands::Deluser { name } => {
            let client = ClientProfile::load(&cli.dir)?.client()?;
            client.delete_user(name).await?;
            println!("✓ Deleted user {}", name);
        }
        Commands::Lsusers => {
            let client = ClientProfile::load(&cli.dir)?.client()?;
            for user in client.list_users().await? {
                println!(
                    "{:<20} {}{}{}",
                    user.name,
                    user.fingerprint,
                    if user.admin { "  admin" } else { "" },
                    if user.registered.is_some() { "" } else { "  (pending)" }
                );
            }
        }
        Commands::Delete { tunnel } => {
            let client = ClientProfile::load(&cli.dir)?.client()?;
            client.delete_definition(tunnel).await?;
            println!("✓ Deleted {} (a backup was kept on the server)", tunnel);
        }
        Commands::Export { tunnel, file } => export(&cli.dir, tunnel, file).await?,
        Commands::Check { file } => check_definition(&expand_path(file)?)?,
        Commands::Ticket => {
            let client = ClientProfile::load(&cli.dir)?.client()?;
            println!("{}", client.issue_ticket().await?);
        }
        Commands::Version => {
            println!("tunnel-depot {}", env!("CARGO_PKG_VERSION"));
            if let Ok(profile) = ClientProfile::load(&cli.dir) {
                let info = profile.client()?.package_info().await?;
                println!(
                    "server {} {} at {}:{}",
                    info.name, info.version, profile.config.server.host, profile.config.server.port
                );
            }
        }
    }

    Ok(())
}

/// Run depot server
async fn run_server(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    check_config_file_permissions(&config_path)?;

    info!("Loading server configuration from: {}", config_path.display());
    let server_config = AppConfig::load_server_config(&config_path)?;

    server::run_server(server_config).await
}

fn init_store(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    let server_config = AppConfig::load_server_config(&config_path)?;

    let fingerprint = server::init_store(&server_config)?;
    println!("✓ Store ready at {}", server_config.store_dir.display());
    println!("✓ Server fingerprint: {}", fingerprint);
    println!("\nCreate the first (admin) user with `tunnel-depot newuser <name>` on this host.");
    Ok(())
}

async fn register(dir: &str, host: &str, token: &str, port: u16) -> Result<()> {
    let base = expand_path(dir)?;
    let client = SyncClient::new(ClientContext::new(host, port))?;
    let registration = client
        .register(token)
        .await
        .with_context(|| format!("Registration with {}:{} failed", host, port))?;

    save_registration(&base, host, port, &registration)?;
    println!("✓ Registered with {}:{}", host, port);
    println!("✓ Server fingerprint pinned: {}", registration.fingerprint);
    println!("✓ Client files written to {}", base.display());
    Ok(())
}

/// 创建用户；客户端尚未注册时以匿名身份连接本机服务器（仅对空注册表有效）
async fn new_user(dir: &str, name: &str, admin: bool) -> Result<()> {
    let client = match ClientProfile::load(dir) {
        Ok(profile) => profile.client()?,
        Err(_) => {
            info!("No client registration found, connecting anonymously to localhost");
            SyncClient::new(ClientContext::default())?
        }
    };

    let user = client.new_user(name, admin).await?;
    println!(
        "✓ Created user {}{}",
        user.name,
        if user.admin { " (admin)" } else { "" }
    );
    if let Some(token) = &user.token {
        println!("  Registration token: {}", token);
    }
    Ok(())
}

async fn export(dir: &str, name: &str, file: &str) -> Result<()> {
    let profile = ClientProfile::load(dir)?;
    let client = profile.client()?;

    let mut def = tunnel::load_by_name(name, &profile.tunnels_dir())?;
    let restored = client.unveil(&mut def).await?;

    let out = expand_path(file)?;
    tunnel::save(&def, &out)?;
    println!("✓ Exported {} to {} ({} secrets restored)", name, out.display(), restored);
    Ok(())
}

fn check_definition(path: &Path) -> Result<()> {
    println!("Checking tunnel definition: {}\n", path.display());

    match tunnel::load_file(path) {
        Ok(def) => {
            let summary = def.summarize();
            println!("✓ Format version: {}", tunnel::format_version(def.version));
            println!("✓ Description: {}", summary.description);
            println!("✓ Hosts: {}", summary.hosts.join(", "));
            println!("✓ Forwards: {}", def.all_forwards().count());
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !tunnel::is_valid_file_name(&file_name) {
                println!("⚠ Warning: file name is not accepted by the server ([0-9a-z_.-], .ini)");
            }
            println!("\n✓ Tunnel definition is valid!");
            Ok(())
        }
        Err(e) => {
            println!("✗ Tunnel definition is invalid!");
            println!("\nError details:");
            println!("{}", e);
            Err(e.into())
        }
    }
}

fn print_manifest(entries: &[ManifestEntry]) {
    for entry in entries {
        match (&entry.summary, &entry.error) {
            (_, Some(error)) => println!("{:<24} ✗ {}", entry.name, error),
            (Some(summary), None) => {
                let mut flags = Vec::new();
                if summary.vpnc {
                    flags.push("vpnc");
                }
                if summary.openconnect {
                    flags.push("openconnect");
                }
                if summary.socks {
                    flags.push("socks");
                }
                if summary.local_only {
                    flags.push("local");
                }
                println!(
                    "{:<24} {} [{}] {}",
                    entry.name,
                    summary.description,
                    summary.hosts.join(","),
                    flags.join(" ")
                );
            }
            (None, None) => println!("{}", entry.name),
        }
    }
    println!("\n{} tunnel definitions", entries.len());
}
