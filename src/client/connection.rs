use super::ClientContext;
use crate::error::{DepotError, Result};
use crate::tls;
use crate::wire::{read_body, send_body, Request, Response, DEFAULT_MAX_HEADER_SIZE};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// 响应体上限（含附加文件下载）
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// 一次请求/响应交换的结果
#[derive(Debug)]
pub struct Exchange {
    pub response: Response,
    /// 服务器叶证书指纹
    pub server_fingerprint: String,
}

/// HTTP/2 authority；IPv6 地址需要方括号
fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 建立连接并完成一次 HTTP/2 请求/响应交换
///
/// 固定了服务器指纹时，证书校验在 TLS 握手中进行；指纹不匹配则握手失败，
/// 不会发送任何请求数据。
pub async fn exchange(
    ctx: &ClientContext,
    tls_config: Arc<rustls::ClientConfig>,
    request: &Request,
) -> Result<Exchange> {
    let attempt = async {
        let addr = authority(&ctx.host, ctx.port);
        let tcp_stream = TcpStream::connect((ctx.host.as_str(), ctx.port))
            .await
            .map_err(|e| DepotError::transport(format!("failed to connect to {}: {}", addr, e)))?;

        let server_name = ServerName::try_from(ctx.host.clone())
            .map_err(|_| DepotError::transport(format!("invalid server name {}", ctx.host)))?;

        let tls_stream = TlsConnector::from(tls_config)
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| {
                tls::fingerprint_mismatch(&e).unwrap_or_else(|| {
                    DepotError::transport(format!("TLS handshake with {} failed: {}", addr, e))
                })
            })?;

        let server_fingerprint = {
            let (_, session) = tls_stream.get_ref();
            session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|leaf| tls::fingerprint(leaf.as_ref()))
                .ok_or_else(|| DepotError::transport("server presented no certificate"))?
        };

        let (send_request, connection) = h2::client::Builder::new()
            .max_header_list_size(DEFAULT_MAX_HEADER_SIZE as u32)
            .handshake::<_, Bytes>(tls_stream)
            .await?;

        // 在后台驱动 HTTP/2 连接，请求句柄释放后连接自行结束
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP/2 connection closed: {}", e);
            }
        });

        let mut send_request = send_request.ready().await?;
        debug!("{} {} via {}", request.method, request.path, addr);
        let head = request.to_http(&addr)?;
        let (response_future, mut body_stream) =
            send_request.send_request(head, request.body.is_empty())?;

        if !request.body.is_empty() {
            // 服务器可能不读完请求体就答复，此时以响应为准
            if let Err(e) = send_body(&mut body_stream, Bytes::from(request.body.clone())).await {
                debug!("Request body to {} not fully sent: {}", addr, e);
            }
        }

        let (parts, mut body) = response_future.await?.into_parts();
        let body = read_body(&mut body, MAX_RESPONSE_SIZE).await?;

        Ok::<_, DepotError>(Exchange {
            response: Response::from_parts(parts, body),
            server_fingerprint,
        })
    };

    timeout(ctx.timeout, attempt)
        .await
        .map_err(|_| DepotError::timeout(ctx.timeout))?
}
