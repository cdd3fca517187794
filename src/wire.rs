//! Request/response messages carried over HTTP/2 on the TLS stream.
//!
//! Framing is left to `h2`; this module converts between the depot's owned
//! messages and `http` heads, and moves bodies through the h2 streams with
//! flow control and a size limit.

use crate::error::{DepotError, Result};
use bytes::Bytes;
use h2::{RecvStream, SendStream};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::Serialize;

/// 协议版本主号，请求与响应都携带
pub const PROTOCOL_VERSION: &str = "1";

pub const VERSION_HEADER: &str = "x-depot-version";
pub const AUTHENTICATED_HEADER: &str = "x-depot-authenticated";
pub const TICKET_HEADER: &str = "x-depot-ticket";

/// 请求体默认上限（4MB）
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// 请求头列表默认上限（16KB）
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// 由收到的 HTTP/2 请求头和已读完的请求体构造
    pub fn from_parts(parts: http::request::Parts, body: Vec<u8>) -> Self {
        Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|_| DepotError::protocol(format!("invalid value for header {}", name)))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 查询参数（已做 URL 解码）
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// 路径分段，空段被忽略
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// 构造发往 `authority` 的 HTTP/2 请求头
    pub fn to_http(&self, authority: &str) -> Result<http::Request<()>> {
        let uri: Uri = format!("https://{}{}", authority, self.target())
            .parse()
            .map_err(|e| DepotError::protocol(format!("invalid request target: {}", e)))?;

        let mut head = http::Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(())
            .map_err(|e| DepotError::protocol(format!("invalid request: {}", e)))?;
        *head.headers_mut() = self.headers.clone();
        if !self.body.is_empty() {
            head.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        }
        Ok(head)
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 由收到的 HTTP/2 响应头和已读完的响应体构造
    pub fn from_parts(parts: http::response::Parts, body: Vec<u8>) -> Self {
        Self {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self> {
        Ok(Self::new(status, "application/json", serde_json::to_vec(value)?))
    }

    pub fn text(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body)
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self::new(StatusCode::OK, "application/octet-stream", body)
    }

    /// `{"error": message}`
    pub fn error(status: StatusCode, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string();
        Self::new(status, "application/json", body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
    }

    /// 错误响应中的说明文字
    pub fn error_message(&self) -> String {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).trim().to_string())
    }

    /// 构造 HTTP/2 响应头
    pub fn to_http(&self) -> Result<http::Response<()>> {
        let mut head = http::Response::builder()
            .status(self.status)
            .body(())
            .map_err(|e| DepotError::protocol(format!("invalid response: {}", e)))?;
        *head.headers_mut() = self.headers.clone();
        head.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        Ok(head)
    }
}

/// 声明的 Content-Length 超过上限时直接拒绝，不读取请求体
pub fn check_declared_length(headers: &HeaderMap, limit: usize) -> Result<()> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match declared {
        Some(len) if len > limit as u64 => Err(DepotError::transport(format!(
            "body of {} bytes exceeds limit of {} bytes",
            len, limit
        ))),
        _ => Ok(()),
    }
}

/// 读完一个 HTTP/2 消息体，超过 `limit` 字节时返回错误
pub async fn read_body(body: &mut RecvStream, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if out.len() + chunk.len() > limit {
            return Err(DepotError::transport(format!(
                "body exceeds limit of {} bytes",
                limit
            )));
        }
        // 释放流量控制窗口，对端才能继续发送
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// 按对端窗口分块发送消息体，最后一块带 END_STREAM
pub async fn send_body(stream: &mut SendStream<Bytes>, body: Bytes) -> Result<()> {
    let mut remaining = body;
    if remaining.is_empty() {
        stream.send_data(remaining, true)?;
        return Ok(());
    }

    while !remaining.is_empty() {
        stream.reserve_capacity(remaining.len());
        let available = match std::future::poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(available)) => available,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(DepotError::transport("stream closed while sending body")),
        };
        if available == 0 {
            continue;
        }
        let chunk = remaining.split_to(available.min(remaining.len()));
        stream.send_data(chunk, remaining.is_empty())?;
    }
    Ok(())
}
