// 隧道定义模块 - 版本化的 INI 文本格式

pub mod ini;
mod obfuscate;
mod parse;
mod save;
mod validator;

pub use obfuscate::{obfuscate, reference_id, unveil, KeyResolver, SECRET_TAG};
pub use parse::{expand_forward_ranges, parse, parse_version};
pub use save::{format_version, save, to_ini_string};
pub use validator::TunnelValidator;

use crate::error::{DepotError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// 当前写出的格式版本（以百分之一为单位，320 即 3.2）
pub const CURRENT_VERSION: u32 = 320;

/// 可解析的最高格式版本
pub const MAX_SUPPORTED_VERSION: u32 = 320;

/// 低于该版本的定义走旧格式迁移路径
pub const LEGACY_VERSION_BELOW: u32 = 300;

/// 转发注释从 3.2 开始支持
pub const COMMENT_MIN_VERSION: u32 = 320;

/// `ip:port` 形式的端点
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 单条端口转发
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Forward {
    pub from: Endpoint,
    pub to: Endpoint,
}

/// 一组带描述的转发
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardGroup {
    pub name: String,
    pub comment: Option<String>,
    pub forwards: Vec<Forward>,
}

/// SSH 主机
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Host {
    pub addr: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub key: Option<String>,
    pub via: Option<String>,
    pub socks: Option<String>,
    pub keepalive: Option<u32>,
}

/// VPN 提供方类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnKind {
    Vpnc,
    OpenConnect,
}

impl VpnKind {
    pub fn section_name(self) -> &'static str {
        match self {
            VpnKind::Vpnc => "vpnc",
            VpnKind::OpenConnect => "openconnect",
        }
    }
}

/// VPN 提供方设置（保持原始顺序）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnProvider {
    pub kind: VpnKind,
    pub settings: Vec<(String, String)>,
}

/// `[vpn routes]` 中的一条路由
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnRoute {
    pub network: String,
    pub prefix_len: u8,
}

/// 隧道定义
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelDefinition {
    pub version: u32,
    pub author: Option<String>,
    pub description: Option<String>,
    pub main: Option<String>,
    pub hosts: BTreeMap<String, Host>,
    pub forwards: Vec<ForwardGroup>,
    pub vpn: Option<VpnProvider>,
    pub vpn_routes: Vec<VpnRoute>,
}

impl TunnelDefinition {
    /// 所有分组中的转发
    pub fn all_forwards(&self) -> impl Iterator<Item = &Forward> {
        self.forwards.iter().flat_map(|g| g.forwards.iter())
    }

    pub fn has_forwards(&self) -> bool {
        self.all_forwards().next().is_some()
    }

    pub fn summarize(&self) -> Summary {
        let socks = self
            .main
            .as_ref()
            .and_then(|name| self.hosts.get(name))
            .is_some_and(|host| host.socks.is_some());

        Summary {
            description: self.description.clone().unwrap_or_default(),
            vpnc: matches!(&self.vpn, Some(v) if v.kind == VpnKind::Vpnc),
            openconnect: matches!(&self.vpn, Some(v) if v.kind == VpnKind::OpenConnect),
            socks,
            hosts: self.hosts.keys().cloned().collect(),
            local_only: self.hosts.is_empty(),
        }
    }
}

/// 清单中展示的定义摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub description: String,
    pub vpnc: bool,
    pub openconnect: bool,
    pub socks: bool,
    pub hosts: Vec<String>,
    pub local_only: bool,
}

/// 读取、解析并校验定义文件
pub fn load_file(path: &Path) -> Result<TunnelDefinition> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DepotError::not_found(format!(
                "tunnel definition {}",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let def = parse(&text)?;
    TunnelValidator::validate(&def)?;
    Ok(def)
}

/// 按名称在目录中查找定义（可省略 `.ini` 后缀）
pub fn load_by_name(name: &str, dir: &Path) -> Result<TunnelDefinition> {
    load_file(&resolve_name(name, dir))
}

pub fn resolve_name(name: &str, dir: &Path) -> PathBuf {
    if name.ends_with(".ini") {
        dir.join(name)
    } else {
        dir.join(format!("{}.ini", name))
    }
}

/// 文件名去掉目录和 `.ini` 后缀
pub fn name_of(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.strip_suffix(".ini").map(str::to_string).unwrap_or(base)
}

static FILE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-z_.\-]+\.ini$").expect("static regex is valid"));

/// 上传文件名策略：小写字母数字与 `_.-`，必须以 `.ini` 结尾
pub fn is_valid_file_name(name: &str) -> bool {
    FILE_NAME_RE.is_match(name) && name != ".ini"
}

/// [`content_hash`] 输出的十六进制长度
pub const CONTENT_HASH_LEN: usize = 64;

/// 内容哈希（sha256 十六进制）
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
description = Lab network
author = Ops <ops@example.com>
main = gw
version = 3.2

[hosts.gw]
addr = 192.0.2.10
user = admin
password = s3cret
socks = 127.0.0.1:1080

[forwards.web]
comment = internal dashboards
127.0.0.1:3000-3002 = 10.0.0.5
127.0.0.2:8080 = 10.0.0.6:80
"#;

    #[test]
    fn test_summary() {
        let def = parse(SAMPLE).unwrap();
        let summary = def.summarize();
        assert_eq!(summary.description, "Lab network");
        assert!(summary.socks);
        assert!(!summary.vpnc);
        assert!(!summary.local_only);
        assert_eq!(summary.hosts, vec!["gw".to_string()]);
    }

    #[test]
    fn test_file_name_policy() {
        assert!(is_valid_file_name("lab-net_2.ini"));
        assert!(!is_valid_file_name("Lab.ini"));
        assert!(!is_valid_file_name("lab.txt"));
        assert!(!is_valid_file_name("../lab.ini"));
        assert!(!is_valid_file_name(".ini"));
    }

    #[test]
    fn test_name_of() {
        assert_eq!(name_of(Path::new("/tmp/x/lab.ini")), "lab");
        assert_eq!(name_of(Path::new("lab")), "lab");
    }

    #[test]
    fn test_load_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lab.ini"), SAMPLE).unwrap();

        let def = load_by_name("lab", dir.path()).unwrap();
        assert_eq!(def.main.as_deref(), Some("gw"));
        assert!(load_by_name("lab.ini", dir.path()).is_ok());
        assert!(load_by_name("missing", dir.path()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"").len(), 64);
    }
}
