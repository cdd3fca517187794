use super::ini::IniFile;
use super::{TunnelDefinition, CURRENT_VERSION};
use crate::error::Result;
use crate::ranges;
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;

/// 版本号格式化（320 -> "3.2"，300 -> "3"）
pub fn format_version(version: u32) -> String {
    let major = version / 100;
    let minor = version % 100;
    match minor {
        0 => major.to_string(),
        m if m % 10 == 0 => format!("{}.{}", major, m / 10),
        m => format!("{}.{:02}", major, m),
    }
}

/// 序列化为当前版本的 INI 文本
///
/// 源端口与目标端口相同的转发按 (源主机, 目标主机) 分组并压缩为端口范围。
pub fn to_ini_string(def: &TunnelDefinition) -> String {
    let mut ini = IniFile::new();

    let general = ini.section_mut("general");
    general.set("version", format_version(def.version.max(CURRENT_VERSION)));
    if let Some(author) = &def.author {
        general.set("author", author.as_str());
    }
    if let Some(description) = &def.description {
        general.set("description", description.as_str());
    }
    if let Some(main) = &def.main {
        general.set("main", main.as_str());
    }

    for (name, host) in &def.hosts {
        let section = ini.section_mut(&format!("hosts.{}", name));
        let fields = [
            ("addr", host.addr.clone()),
            ("user", host.user.clone()),
            ("port", host.port.map(|p| p.to_string())),
            ("password", host.password.clone()),
            ("key", host.key.clone()),
            ("via", host.via.clone()),
            ("socks", host.socks.clone()),
            ("keepalive", host.keepalive.map(|k| k.to_string())),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                section.set(key, value);
            }
        }
    }

    for group in &def.forwards {
        let section = ini.section_mut(&format!("forwards.{}", group.name));
        if let Some(comment) = &group.comment {
            section.set("comment", comment.as_str());
        }

        let mut grouped: BTreeMap<(&str, &str), Vec<u16>> = BTreeMap::new();
        for forward in &group.forwards {
            if forward.from.port == forward.to.port {
                grouped
                    .entry((forward.from.host.as_str(), forward.to.host.as_str()))
                    .or_default()
                    .push(forward.from.port);
            } else {
                section.push(forward.from.to_string(), forward.to.to_string());
            }
        }

        for ((from_host, to_host), ports) in grouped {
            for range in ranges::compress(&ports) {
                section.push(format!("{}:{}", from_host, range), to_host);
            }
        }
    }

    if let Some(vpn) = &def.vpn {
        let section = ini.section_mut(vpn.kind.section_name());
        for (key, value) in &vpn.settings {
            section.push(key.as_str(), value.as_str());
        }
    }

    if !def.vpn_routes.is_empty() {
        let section = ini.section_mut("vpn routes");
        for route in &def.vpn_routes {
            section.push(route.network.as_str(), route.prefix_len.to_string());
        }
    }

    ini.to_string()
}

/// 写入文件
pub fn save(def: &TunnelDefinition, path: &Path) -> Result<()> {
    std::fs::write(path, to_ini_string(def))
        .with_context(|| format!("Failed to write tunnel definition to {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{parse, TunnelValidator};
    use super::*;
    use std::collections::BTreeSet;

    const SAMPLE: &str = "\
[general]
version = 3
author = ops
description = lab
main = gw

[hosts.gw]
addr = 192.0.2.10
user = admin
key = \"-----BEGIN KEY-----\\nAAAA\\n-----END KEY-----\"
port = 2222

[forwards.web]
127.0.0.1:3000-3002 = 10.0.0.5
127.0.0.1:3005 = 10.0.0.5
127.0.0.2:8080 = 10.0.0.6:80

[forwards.db]
127.0.0.3:5432 = 10.0.0.7
";

    fn pair_set(def: &TunnelDefinition) -> BTreeSet<(String, String)> {
        def.all_forwards()
            .map(|f| (f.from.to_string(), f.to.to_string()))
            .collect()
    }

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(300), "3");
        assert_eq!(format_version(320), "3.2");
        assert_eq!(format_version(325), "3.25");
        assert_eq!(format_version(305), "3.05");
    }

    #[test]
    fn test_round_trip_preserves_forward_set() {
        let def = parse(SAMPLE).unwrap();
        TunnelValidator::validate(&def).unwrap();

        let text = to_ini_string(&def);
        let again = parse(&text).unwrap();
        TunnelValidator::validate(&again).unwrap();

        assert_eq!(pair_set(&def), pair_set(&again));
        assert_eq!(again.hosts["gw"].key, def.hosts["gw"].key);
        assert_eq!(again.hosts["gw"].port, Some(2222));
    }

    #[test]
    fn test_description_with_backslashes_round_trips() {
        let mut def = parse(SAMPLE).unwrap();
        def.description = Some("C:\\new files".to_string());

        let again = parse(&to_ini_string(&def)).unwrap();
        assert_eq!(again.description.as_deref(), Some("C:\\new files"));
    }

    #[test]
    fn test_save_compresses_ranges() {
        let def = parse(SAMPLE).unwrap();
        let text = to_ini_string(&def);
        assert!(text.contains("127.0.0.1:3000-3002 = 10.0.0.5"));
        assert!(text.contains("127.0.0.1:3005 = 10.0.0.5"));
        assert!(text.contains("127.0.0.2:8080 = 10.0.0.6:80"));
    }

    #[test]
    fn test_save_never_downgrades_version() {
        let mut def = parse(SAMPLE).unwrap();
        assert!(to_ini_string(&def).contains("version = 3.2"));

        def.version = 325;
        assert!(to_ini_string(&def).contains("version = 3.25"));
    }

    #[test]
    fn test_save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.ini");
        let def = parse(SAMPLE).unwrap();
        save(&def, &path).unwrap();
        let reloaded = super::super::load_file(&path).unwrap();
        assert_eq!(pair_set(&def), pair_set(&reloaded));
    }
}
