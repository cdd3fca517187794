/// 客户端与服务器之间的协议消息定义
use crate::tunnel::Summary;
use serde::{Deserialize, Serialize};

/// `GET /register/{token}` 的响应：新签发的证书与私钥
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub cert: String,
    pub key: String,
}

/// `POST /newtoken` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenReply {
    pub token: String,
}

/// `PUT /store/{name}` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreReply {
    pub status: String,
    pub length: usize,
}

impl StoreReply {
    pub fn ok(length: usize) -> Self {
        Self {
            status: "ok".to_string(),
            length,
        }
    }
}

/// `GET /key/{id}` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyReply {
    pub key: String,
}

/// `POST /ticket` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketReply {
    pub ticket: String,
}

/// `GET /ticket` 的响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketStatus {
    pub user: String,
    pub ip: String,
    pub valid_until: u64,
}

/// `GET /pkg` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    /// `extra/packages.json` 的内容（若存在）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<serde_json::Value>,
}

/// 清单中的一行
///
/// 解析成功时带有摘要字段，失败时带有 `error`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub name: String,
    /// 毫秒时间戳
    pub mtime: u64,
    /// 内容哈希；旧服务器可能不提供，或以 `sha1` 字段提供
    #[serde(default, alias = "sha1", skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(flatten)]
    pub summary: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestEntry {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_entry_with_summary() {
        let entry = ManifestEntry {
            name: "lab.ini".to_string(),
            mtime: 1_700_000_000_123,
            hash: Some("ab".repeat(32)),
            summary: Some(Summary {
                description: "Lab".to_string(),
                vpnc: false,
                openconnect: true,
                socks: false,
                hosts: vec!["gw".to_string()],
                local_only: false,
            }),
            error: None,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["description"], "Lab");
        assert_eq!(json["localOnly"], false);
        assert!(json.get("error").is_none());

        let back: ManifestEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_manifest_entry_error_row() {
        let json = r#"{"name":"bad.ini","mtime":5,"hash":"00","error":"Format error: missing [general]"}"#;
        let entry: ManifestEntry = serde_json::from_str(json).unwrap();
        assert!(entry.is_error());
        assert!(entry.summary.is_none());
    }

    #[test]
    fn test_manifest_entry_accepts_sha1_field() {
        let json = r#"{"name":"old.ini","mtime":1000,"sha1":"da39a3ee5e6b4b0d3255bfef95601890afd80709"}"#;
        let entry: ManifestEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.hash.as_deref(), Some("da39a3ee5e6b4b0d3255bfef95601890afd80709"));
        assert!(serde_json::to_string(&entry).unwrap().contains("\"hash\""));
    }

    #[test]
    fn test_manifest_entry_without_hash() {
        let entry: ManifestEntry = serde_json::from_str(r#"{"name":"old.ini","mtime":1000}"#).unwrap();
        assert!(entry.hash.is_none());
        assert!(entry.summary.is_none());
    }

    #[test]
    fn test_store_reply() {
        let reply = StoreReply::ok(42);
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"status":"ok","length":42}"#
        );
    }
}
