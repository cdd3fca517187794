use super::ini::{IniFile, Section};
use super::{
    Endpoint, Forward, ForwardGroup, Host, TunnelDefinition, VpnKind, VpnProvider, VpnRoute,
    COMMENT_MIN_VERSION, LEGACY_VERSION_BELOW, MAX_SUPPORTED_VERSION,
};
use crate::error::{DepotError, Result};
use crate::ranges;
use tracing::debug;

/// 解析隧道定义文本
///
/// 旧版本（< 3.0）的段落命名先迁移为当前形式，再走同一套严格解析，
/// 未知段落和未知字段在这里直接拒绝。
pub fn parse(text: &str) -> Result<TunnelDefinition> {
    let ini = IniFile::parse(text)?;

    let general = ini
        .section("general")
        .ok_or_else(|| DepotError::format("missing required section [general]"))?;
    let version_text = general
        .get("version")
        .ok_or_else(|| DepotError::format("missing required field \"version\" in general section"))?;
    let version = parse_version(version_text)?;

    if version > MAX_SUPPORTED_VERSION {
        return Err(DepotError::format(format!(
            "unsupported format version {} (newest supported is {})",
            version_text,
            super::format_version(MAX_SUPPORTED_VERSION)
        )));
    }

    let sections = if version < LEGACY_VERSION_BELOW {
        debug!("Migrating legacy tunnel definition (version {})", version_text);
        migrate_legacy(ini)
    } else {
        ini.into_sections()
    };

    let mut def = TunnelDefinition {
        version,
        ..Default::default()
    };

    for section in &sections {
        let name = section.name.as_str();
        if name == "general" {
            parse_general(&mut def, section)?;
        } else if let Some(host) = name.strip_prefix("hosts.") {
            parse_host(&mut def, host, section)?;
        } else if let Some(group) = name.strip_prefix("forwards.") {
            parse_forward_group(&mut def, group, section)?;
        } else if name == "vpnc" || name == "openconnect" {
            parse_vpn(&mut def, name, section)?;
        } else if name == "vpn routes" {
            parse_vpn_routes(&mut def, section)?;
        } else {
            return Err(DepotError::format(format!("unknown section [{}]", name)));
        }
    }

    Ok(def)
}

/// 解析版本号，返回以百分之一为单位的整数（"3.2" -> 320）
pub fn parse_version(text: &str) -> Result<u32> {
    let text = text.trim();
    let bad = || DepotError::format(format!("malformed version \"{}\"", text));

    let (major, minor) = text.split_once('.').unwrap_or((text, ""));
    if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    if minor.len() > 2 || !minor.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }

    let major: u32 = major.parse().map_err(|_| bad())?;
    let minor: u32 = match minor.len() {
        0 => 0,
        1 => minor.parse::<u32>().map_err(|_| bad())? * 10,
        _ => minor.parse().map_err(|_| bad())?,
    };
    major
        .checked_mul(100)
        .and_then(|v| v.checked_add(minor))
        .ok_or_else(bad)
}

/// 展开转发的端口范围
///
/// `ip:a-b = ip` 对每个端口生成一条转发；目标带端口时源端必须是单个端口。
pub fn expand_forward_ranges(entries: &[(String, String)]) -> Result<Vec<Forward>> {
    let mut forwards = Vec::new();

    for (from, to) in entries {
        let (from_host, from_ports) = match from.split_once(':') {
            Some((h, p)) if !h.is_empty() && !p.is_empty() && !p.contains(':') => (h, p),
            _ => {
                return Err(DepotError::format(format!(
                    "malformed forward source \"{}\"",
                    from
                )))
            }
        };
        let ports = ranges::expand(from_ports).map_err(|e| {
            DepotError::format(format!("malformed forward source \"{}\": {}", from, e))
        })?;

        match to.split_once(':') {
            Some((to_host, to_port)) => {
                if to_host.is_empty() || to_port.is_empty() {
                    return Err(DepotError::format(format!(
                        "malformed forward destination \"{}\"",
                        to
                    )));
                }
                if ports.len() > 1 {
                    return Err(DepotError::format(format!(
                        "malformed forward destination \"{}\" (source is a port range)",
                        to
                    )));
                }
                let to_port = to_port.parse::<u16>().map_err(|_| {
                    DepotError::format(format!("malformed forward destination \"{}\"", to))
                })?;
                forwards.push(Forward {
                    from: Endpoint::new(from_host, ports[0]),
                    to: Endpoint::new(to_host, to_port),
                });
            }
            None => {
                if to.is_empty() {
                    return Err(DepotError::format(format!(
                        "missing forward destination for \"{}\"",
                        from
                    )));
                }
                forwards.extend(ports.into_iter().map(|port| Forward {
                    from: Endpoint::new(from_host, port),
                    to: Endpoint::new(to.as_str(), port),
                }));
            }
        }
    }

    Ok(forwards)
}

fn parse_general(def: &mut TunnelDefinition, section: &Section) -> Result<()> {
    for (key, value) in section.options() {
        match key {
            "version" => {}
            "author" => def.author = Some(value.to_string()),
            "description" => def.description = Some(value.to_string()),
            "main" => def.main = Some(value.to_string()),
            other => {
                return Err(DepotError::format(format!(
                    "unrecognized field \"{}\" in general section",
                    other
                )))
            }
        }
    }
    Ok(())
}

fn parse_host(def: &mut TunnelDefinition, name: &str, section: &Section) -> Result<()> {
    if name.is_empty() {
        return Err(DepotError::format("host section without a name"));
    }

    let mut host = Host::default();
    for (key, value) in section.options() {
        match key {
            "addr" => host.addr = Some(value.to_string()),
            "user" => host.user = Some(value.to_string()),
            "password" => host.password = Some(value.to_string()),
            "key" => host.key = Some(value.to_string()),
            "via" => host.via = Some(value.to_string()),
            "socks" => host.socks = Some(value.to_string()),
            "port" => {
                host.port = Some(value.parse().map_err(|_| {
                    DepotError::format(format!("malformed port \"{}\" on host \"{}\"", value, name))
                })?)
            }
            "keepalive" => {
                host.keepalive = Some(value.parse().map_err(|_| {
                    DepotError::format(format!(
                        "malformed keepalive \"{}\" on host \"{}\"",
                        value, name
                    ))
                })?)
            }
            // 旧版字段，忽略
            "prompt" => {}
            other => {
                return Err(DepotError::format(format!(
                    "unrecognized field \"{}\" on host \"{}\"",
                    other, name
                )))
            }
        }
    }

    def.hosts.insert(name.to_string(), host);
    Ok(())
}

fn parse_forward_group(def: &mut TunnelDefinition, name: &str, section: &Section) -> Result<()> {
    let mut group = ForwardGroup {
        name: name.to_string(),
        ..Default::default()
    };

    let mut entries = Vec::new();
    for (key, value) in section.options() {
        if key == "comment" {
            if def.version < COMMENT_MIN_VERSION {
                return Err(DepotError::format(
                    "forward comments require format version 3.2 or above",
                ));
            }
            group.comment = Some(value.to_string());
            continue;
        }
        entries.push((key.to_string(), value.to_string()));
    }

    group.forwards = expand_forward_ranges(&entries)?;
    def.forwards.push(group);
    Ok(())
}

fn parse_vpn(def: &mut TunnelDefinition, name: &str, section: &Section) -> Result<()> {
    if def.vpn.is_some() {
        return Err(DepotError::format("at most one VPN provider section is allowed"));
    }
    let kind = if name == "vpnc" {
        VpnKind::Vpnc
    } else {
        VpnKind::OpenConnect
    };
    def.vpn = Some(VpnProvider {
        kind,
        settings: section
            .options()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    });
    Ok(())
}

fn parse_vpn_routes(def: &mut TunnelDefinition, section: &Section) -> Result<()> {
    for (network, prefix) in section.options() {
        let prefix_len = prefix
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| {
                DepotError::format(format!("malformed vpn route \"{} = {}\"", network, prefix))
            })?;
        def.vpn_routes.push(VpnRoute {
            network: network.to_string(),
            prefix_len,
        });
    }
    Ok(())
}

/// 旧格式段落名迁移：`[host X]` -> `[hosts.X]`，`[forward X]`/`[localforward X]` -> `[forwards.X]`
fn migrate_legacy(ini: IniFile) -> Vec<Section> {
    let mut out = Vec::new();

    for mut section in ini.into_sections() {
        let name = section.name.clone();
        if let Some(host) = legacy_host_name(&name) {
            section.name = format!("hosts.{}", host);
            if let Some(restored) = section.get("key").map(restore_key_newlines) {
                section.set("key", restored);
            }
        } else if let Some(group) = legacy_forward_name(&name) {
            section.name = format!("forwards.{}", group);
        }
        out.push(section);
    }
    out
}

fn legacy_host_name(section: &str) -> Option<&str> {
    let rest = section.strip_prefix("host ")?;
    (!rest.is_empty() && !rest.contains(' ')).then_some(rest)
}

fn legacy_forward_name(section: &str) -> Option<&str> {
    let rest = section
        .strip_prefix("localforward ")
        .or_else(|| section.strip_prefix("forward "))?
        .trim_start();
    (!rest.is_empty()).then_some(rest)
}

/// 旧格式私钥中换行被替换为空格，按 PEM 头尾标记恢复
fn restore_key_newlines(key: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut armor: Option<String> = None;

    for token in key.split_whitespace() {
        if let Some(current) = armor.as_mut() {
            current.push(' ');
            current.push_str(token);
            if token.ends_with("-----") {
                if let Some(done) = armor.take() {
                    lines.push(done);
                }
            }
            continue;
        }

        let opens_armor = token.starts_with("-----BEGIN") || token.starts_with("-----END");
        if opens_armor && !(token.len() > 5 && token.ends_with("-----")) {
            armor = Some(token.to_string());
        } else {
            lines.push(token.to_string());
        }
    }
    if let Some(rest) = armor {
        lines.push(rest);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
