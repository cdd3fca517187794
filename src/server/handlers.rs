//! Request routing and route handlers.
//!
//! Every request passes the same pipeline: protocol version gate, identity
//! lookup by certificate fingerprint, authorization, read-only gate, handler,
//! audit record, response headers.

use super::users::{now_millis, User};
use super::ServerState;
use crate::audit::AuditRecord;
use crate::certs::write_private;
use crate::error::{DepotError, Result};
use crate::wire::{
    Request, Response, AUTHENTICATED_HEADER, PROTOCOL_VERSION, TICKET_HEADER, VERSION_HEADER,
};
use crate::protocol::{
    Enrollment, KeyReply, ManifestEntry, PackageInfo, StoreReply, TicketReply, TicketStatus,
    TokenReply,
};
use crate::ticket::DEFAULT_TICKET_VALIDITY;
use crate::tunnel::{self, TunnelValidator};
use anyhow::Context;
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, error, info, warn};

/// 连接层提供的请求上下文
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub peer: SocketAddr,
    /// 客户端证书指纹（未出示证书时为 None）
    pub fingerprint: Option<String>,
}

/// 处理一个请求并写审计记录
pub async fn dispatch(state: &ServerState, ctx: &RequestContext, request: &Request) -> Response {
    let user = ctx
        .fingerprint
        .as_deref()
        .and_then(|fp| state.users.find_by_fingerprint(fp));

    let result = match check_version(request) {
        Ok(()) => route(state, ctx, user.as_ref(), request).await,
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(response) => response,
        Err(e) => error_response(&e),
    };

    let user_name = user.as_ref().map(|u| u.name.as_str());
    let record = if response.status.is_success() {
        AuditRecord::info("accepted")
    } else {
        warn!(
            "{} {} from {} rejected with {}",
            request.method, request.path, ctx.peer, response.status
        );
        AuditRecord::warning("rejected").comment(format!(
            "{}: {}",
            response.status.as_u16(),
            response.error_message()
        ))
    }
    .request(ctx.peer, request.method.as_str(), &request.path)
    .user(user_name);

    if let Err(e) = state.audit.record(&record) {
        error!("Failed to write audit record: {}", e);
    }

    response.set_header(VERSION_HEADER, PROTOCOL_VERSION);
    if let Some(name) = user_name {
        response.set_header(AUTHENTICATED_HEADER, name);
    }
    response
}

/// 协议版本检查：主版本号必须一致
fn check_version(request: &Request) -> Result<()> {
    match request.header(VERSION_HEADER) {
        Some(version) if version.split('.').next() == Some(PROTOCOL_VERSION) => Ok(()),
        Some(version) => Err(DepotError::protocol(format!(
            "client protocol version {} is not supported (server speaks {})",
            version, PROTOCOL_VERSION
        ))),
        None => Err(DepotError::protocol("missing protocol version header")),
    }
}

fn error_response(err: &DepotError) -> Response {
    let status = match err {
        DepotError::Format(_) | DepotError::Validation(_) => StatusCode::BAD_REQUEST,
        DepotError::NotFound(_) => StatusCode::NOT_FOUND,
        DepotError::Auth(_) => StatusCode::FORBIDDEN,
        DepotError::Protocol(_) => StatusCode::UPGRADE_REQUIRED,
        DepotError::Http { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {:#}", err);
        return Response::error(status, "internal server error");
    }
    Response::error(status, &err.to_string())
}

async fn route(
    state: &ServerState,
    ctx: &RequestContext,
    user: Option<&User>,
    request: &Request,
) -> Result<Response> {
    let segments = request.segments();

    // 注册和首个用户的创建不要求已认证身份
    match (&request.method, segments.as_slice()) {
        (&Method::GET, ["register", token]) => return register(state, token),
        (&Method::POST, ["users", name]) => {
            let admin = request.query_param("admin").as_deref() == Some("true");
            return create_user(state, user, name, admin).await;
        }
        _ => {}
    }

    let user = user.ok_or_else(|| DepotError::auth("unknown or missing client certificate"))?;

    match (&request.method, segments.as_slice()) {
        (&Method::POST, ["newtoken"]) => new_token(state, user),
        (&Method::GET, ["users"]) => {
            require_admin(user)?;
            list_users(state)
        }
        (&Method::DELETE, ["users", name]) => {
            require_admin(user)?;
            delete_user(state, name)
        }
        (&Method::GET, ["store"]) => list_store(state).await,
        (&Method::GET, ["store", name]) => get_file(state, name).await,
        (&Method::PUT, ["store", name]) => {
            require_writable(state)?;
            put_file(state, name, &request.body).await
        }
        (&Method::DELETE, ["store", name]) => {
            require_writable(state)?;
            delete_file(state, name).await
        }
        (&Method::GET, ["key", id]) => get_key(state, id),
        (&Method::GET, ["extra", name]) => get_extra(state, name).await,
        (&Method::GET, ["pkg"]) => package_info(state).await,
        (&Method::POST, ["ticket"]) => issue_ticket(state, ctx, user),
        (&Method::GET, ["ticket"]) => examine_ticket(state, request),
        _ => Err(DepotError::not_found(format!(
            "no route for {} {}",
            request.method, request.path
        ))),
    }
}

fn require_admin(user: &User) -> Result<()> {
    if user.admin {
        Ok(())
    } else {
        Err(DepotError::auth(format!("{} is not an admin", user.name)))
    }
}

fn require_writable(state: &ServerState) -> Result<()> {
    if state.config.read_only {
        Err(DepotError::auth("server is in read-only mode"))
    } else {
        Ok(())
    }
}

/// 用户名：小写字母数字与 `_.-`，不能以 `.` 开头
pub fn is_valid_user_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
}

fn register(state: &ServerState, token: &str) -> Result<Response> {
    let user = state
        .users
        .take_token(token)
        .ok_or_else(|| DepotError::not_found("registration token is unknown or already used"))?;

    let cert = std::fs::read_to_string(state.layout.user_cert(&user.name))
        .with_context(|| format!("Certificate for {} is missing", user.name))?;
    let key = std::fs::read_to_string(state.layout.user_key(&user.name))
        .with_context(|| format!("Key for {} is missing", user.name))?;

    info!("User {} registered", user.name);
    Response::json(StatusCode::OK, &Enrollment { cert, key })
}

async fn create_user(
    state: &ServerState,
    caller: Option<&User>,
    name: &str,
    admin: bool,
) -> Result<Response> {
    let _creating = state.user_creation.lock().await;

    let caller_is_admin = caller.is_some_and(|u| u.admin);
    if !state.users.is_empty() && !caller_is_admin {
        return Err(DepotError::auth("only admins can create users"));
    }
    if !is_valid_user_name(name) {
        return Err(DepotError::validation(format!("invalid user name {:?}", name)));
    }
    if state.users.contains(name) {
        return Err(DepotError::Http {
            status: StatusCode::CONFLICT.as_u16(),
            message: format!("user {} already exists", name),
        });
    }

    let minted = state.minter.mint(name).await?;
    let cert_path = state.layout.user_cert(name);
    std::fs::write(&cert_path, &minted.cert_pem)
        .with_context(|| format!("Failed to write {:?}", cert_path))?;
    write_private(&state.layout.user_key(name), &minted.key_pem)?;

    let user = state
        .users
        .create(name, minted.fingerprint, admin && caller_is_admin);
    info!(
        "Created user {}{}",
        user.name,
        if user.admin { " (admin)" } else { "" }
    );
    Response::json(StatusCode::OK, &user)
}

fn delete_user(state: &ServerState, name: &str) -> Result<Response> {
    let user = state
        .users
        .delete(name)
        .ok_or_else(|| DepotError::not_found(format!("user {}", name)))?;

    for path in [state.layout.user_cert(name), state.layout.user_key(name)] {
        if let Err(e) = std::fs::remove_file(&path) {
            debug!("Could not remove {:?}: {}", path, e);
        }
    }
    info!("Deleted user {}", user.name);
    Response::json(StatusCode::OK, &serde_json::json!({ "deleted": user.name }))
}

fn list_users(state: &ServerState) -> Result<Response> {
    let users: Vec<User> = state
        .users
        .list()
        .into_iter()
        .map(|user| User { token: None, ..user })
        .collect();
    Response::json(StatusCode::OK, &users)
}

fn new_token(state: &ServerState, user: &User) -> Result<Response> {
    let token = state
        .users
        .renew_token(&user.name)
        .ok_or_else(|| DepotError::not_found(format!("user {}", user.name)))?;
    Response::json(StatusCode::OK, &TokenReply { token })
}

fn modified_millis(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// 单个文件的清单行；解析失败时只影响这一行
async fn manifest_entry(path: &Path, name: String) -> Result<ManifestEntry> {
    let meta = tokio::fs::metadata(path).await?;
    let bytes = tokio::fs::read(path).await?;
    let hash = tunnel::content_hash(&bytes);

    let parsed = std::str::from_utf8(&bytes)
        .map_err(|_| DepotError::format("file is not valid UTF-8"))
        .and_then(tunnel::parse)
        .and_then(|def| TunnelValidator::validate(&def).map(|_| def));

    let (summary, error) = match parsed {
        Ok(def) => (Some(def.summarize()), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Ok(ManifestEntry {
        name,
        mtime: modified_millis(&meta),
        hash: Some(hash),
        summary,
        error,
    })
}

async fn list_store(state: &ServerState) -> Result<Response> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(state.layout.data_dir()).await?;
    while let Some(item) = dir.next_entry().await? {
        let name = item.file_name().to_string_lossy().into_owned();
        if !tunnel::is_valid_file_name(&name) {
            continue;
        }
        match manifest_entry(&item.path(), name.clone()).await {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping {} in manifest: {}", name, e),
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Response::json(StatusCode::OK, &entries)
}

fn stored_path(state: &ServerState, name: &str) -> Result<std::path::PathBuf> {
    if !tunnel::is_valid_file_name(name) {
        return Err(DepotError::not_found(format!("tunnel definition {}", name)));
    }
    Ok(state.layout.data_file(name))
}

async fn read_or_not_found(path: &Path, what: &str) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DepotError::not_found(what)),
        Err(e) => Err(e.into()),
    }
}

async fn get_file(state: &ServerState, name: &str) -> Result<Response> {
    let path = stored_path(state, name)?;
    let bytes = read_or_not_found(&path, &format!("tunnel definition {}", name)).await?;
    Ok(Response::text(StatusCode::OK, bytes))
}

/// 覆盖或删除之前把旧文件移入 backup/
async fn backup_existing(state: &ServerState, name: &str, suffix: &str) -> Result<bool> {
    let current = state.layout.data_file(name);
    if !tokio::fs::try_exists(&current).await? {
        return Ok(false);
    }
    let target = state
        .layout
        .backup_dir()
        .join(format!("{}.{}{}", name, now_millis(), suffix));
    tokio::fs::rename(&current, &target)
        .await
        .with_context(|| format!("Failed to back up {:?} to {:?}", current, target))?;
    debug!("Backed up {} to {:?}", name, target);
    Ok(true)
}

async fn put_file(state: &ServerState, name: &str, body: &[u8]) -> Result<Response> {
    if !tunnel::is_valid_file_name(name) {
        return Err(DepotError::validation(format!(
            "file name {:?} must match [0-9a-z_.-]+.ini",
            name
        )));
    }
    let text = std::str::from_utf8(body)
        .map_err(|_| DepotError::format("tunnel definition is not valid UTF-8"))?;
    let mut def = tunnel::parse(text)?;
    TunnelValidator::validate(&def)?;

    let replaced = backup_existing(state, name, "").await?;

    let stashed = tunnel::obfuscate(&mut def, |secret| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        state.keys.set(id.clone(), secret);
        id
    });
    // 定义文件引用的密钥必须先落盘
    if stashed > 0 {
        state.keys.flush()?;
    }
    let canonical = tunnel::to_ini_string(&def);

    let path = state.layout.data_file(name);
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    tokio::fs::write(&part, canonical.as_bytes())
        .await
        .with_context(|| format!("Failed to write {:?}", part))?;
    tokio::fs::rename(&part, &path)
        .await
        .with_context(|| format!("Failed to store {:?}", path))?;

    info!(
        "Stored {} ({} bytes, {} secrets moved to keystore{})",
        name,
        canonical.len(),
        stashed,
        if replaced { ", previous version backed up" } else { "" }
    );
    Response::json(StatusCode::OK, &StoreReply::ok(canonical.len()))
}

async fn delete_file(state: &ServerState, name: &str) -> Result<Response> {
    stored_path(state, name)?;
    if !backup_existing(state, name, ".deleted").await? {
        return Err(DepotError::not_found(format!("tunnel definition {}", name)));
    }
    info!("Deleted {}", name);
    Response::json(StatusCode::OK, &serde_json::json!({ "deleted": name }))
}

fn get_key(state: &ServerState, id: &str) -> Result<Response> {
    let key = state
        .keys
        .get(id)
        .ok_or_else(|| DepotError::not_found(format!("key {}", id)))?;
    Response::json(StatusCode::OK, &KeyReply { key })
}

async fn get_extra(state: &ServerState, name: &str) -> Result<Response> {
    if name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(DepotError::not_found(format!("extra file {}", name)));
    }
    let bytes =
        read_or_not_found(&state.layout.extra_dir().join(name), &format!("extra file {}", name))
            .await?;
    Ok(Response::bytes(bytes))
}

async fn package_info(state: &ServerState) -> Result<Response> {
    let packages = match tokio::fs::read(state.layout.extra_dir().join("packages.json")).await {
        Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
        Err(_) => None,
    };
    Response::json(
        StatusCode::OK,
        &PackageInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            packages,
        },
    )
}

fn issue_ticket(state: &ServerState, ctx: &RequestContext, user: &User) -> Result<Response> {
    let ticket = state.tickets.issue(
        &user.name,
        &ctx.peer.ip().to_string(),
        DEFAULT_TICKET_VALIDITY,
    )?;
    Response::json(StatusCode::OK, &TicketReply { ticket })
}

fn examine_ticket(state: &ServerState, request: &Request) -> Result<Response> {
    let ticket = request
        .header(TICKET_HEADER)
        .ok_or_else(|| DepotError::auth("missing ticket"))?;
    let info = state
        .tickets
        .examine(ticket)
        .ok_or_else(|| DepotError::auth("invalid or expired ticket"))?;
    Response::json(
        StatusCode::OK,
        &TicketStatus {
            user: info.user,
            ip: info.ip,
            valid_until: info.valid_until,
        },
    )
}
