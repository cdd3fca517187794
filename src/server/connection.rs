use super::handlers::{dispatch, RequestContext};
use super::ServerState;
use crate::audit::AuditRecord;
use crate::tls;
use crate::wire::{
    check_declared_length, read_body, send_body, Request, Response, DEFAULT_MAX_HEADER_SIZE,
};
use anyhow::{Context, Result};
use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

/// TLS 握手超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 等待请求（含请求体）的超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 每条连接允许的并发流
const MAX_CONCURRENT_STREAMS: u32 = 16;

fn malformed_from(peer: SocketAddr) -> AuditRecord {
    AuditRecord::warning("malformed request").client(peer)
}

/// 无法解析的请求也写入审计日志
fn audit_malformed(state: &ServerState, record: AuditRecord, reason: &str) {
    debug!("Malformed request: {}", reason);
    let record = record.comment(reason);
    if let Err(e) = state.audit.record(&record) {
        error!("Failed to write audit record: {}", e);
    }
}

/// 处理一条客户端连接：TLS 握手、HTTP/2 握手，然后逐个处理请求流
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
) -> Result<()> {
    let tls_stream = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    let fingerprint = {
        let (_, session) = tls_stream.get_ref();
        session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| tls::fingerprint(leaf.as_ref()))
    };
    debug!(
        "TLS session from {} ({})",
        peer,
        fingerprint.as_deref().unwrap_or("no client certificate")
    );

    let handshake = h2::server::Builder::new()
        .max_header_list_size(DEFAULT_MAX_HEADER_SIZE as u32)
        .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
        .handshake::<_, Bytes>(tls_stream);
    let mut connection = match timeout(REQUEST_TIMEOUT, handshake).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => {
            let reason = format!("HTTP/2 handshake failed: {}", e);
            audit_malformed(&state, malformed_from(peer), &reason);
            return Ok(());
        }
        Err(_) => {
            audit_malformed(&state, malformed_from(peer), "HTTP/2 handshake timed out");
            return Ok(());
        }
    };

    let ctx = Arc::new(RequestContext { peer, fingerprint });
    let mut closing = false;

    loop {
        let next = if closing {
            connection.accept().await
        } else {
            match timeout(REQUEST_TIMEOUT, connection.accept()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("Connection from {} idle, closing", peer);
                    connection.graceful_shutdown();
                    closing = true;
                    continue;
                }
            }
        };

        match next {
            Some(Ok((request, respond))) => {
                let state = Arc::clone(&state);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(&state, &ctx, request, respond).await {
                        debug!("Failed to answer {}: {:#}", ctx.peer, e);
                    }
                });
            }
            // 对端直接断开不算畸形请求
            Some(Err(e)) if e.is_io() || e.reason() == Some(h2::Reason::NO_ERROR) => {
                debug!("Connection from {} closed: {}", peer, e);
                break;
            }
            Some(Err(e)) => {
                let reason = format!("HTTP/2 protocol error: {}", e);
                audit_malformed(&state, malformed_from(peer), &reason);
                break;
            }
            None => break,
        }
    }

    Ok(())
}

/// 读完一个请求流，交给路由处理并写回响应
async fn serve_stream(
    state: &ServerState,
    ctx: &RequestContext,
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
) -> Result<()> {
    let (parts, mut body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let limit = state.config.max_body_size;

    let received = timeout(REQUEST_TIMEOUT, async {
        check_declared_length(&parts.headers, limit)?;
        read_body(&mut body, limit).await
    })
    .await;
    let response = match received {
        Ok(Ok(bytes)) => {
            let request = Request::from_parts(parts, bytes);
            let response = dispatch(state, ctx, &request).await;
            debug!("{} {} {} -> {}", ctx.peer, method, path, response.status);
            response
        }
        Ok(Err(e)) => {
            let record = AuditRecord::warning("malformed request").request(
                ctx.peer,
                method.as_str(),
                &path,
            );
            audit_malformed(state, record, &e.to_string());
            Response::error(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(_) => {
            let record = AuditRecord::warning("malformed request").request(
                ctx.peer,
                method.as_str(),
                &path,
            );
            audit_malformed(state, record, "request body timed out");
            Response::error(StatusCode::REQUEST_TIMEOUT, "request body timed out")
        }
    };

    let head = response.to_http()?;
    let mut stream = respond
        .send_response(head, response.body.is_empty())
        .context("Failed to send response head")?;
    if !response.body.is_empty() {
        send_body(&mut stream, Bytes::from(response.body))
            .await
            .context("Failed to send response body")?;
    }
    Ok(())
}
