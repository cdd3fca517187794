use super::{Endpoint, Host, TunnelDefinition};
use crate::error::{DepotError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+:[0-9]+$").expect("static regex is valid")
});

/// 隧道定义验证器 - 纯函数，加载后和推送前都要运行
pub struct TunnelValidator;

impl TunnelValidator {
    /// 验证完整定义
    pub fn validate(def: &TunnelDefinition) -> Result<()> {
        Self::validate_required(def.author.as_deref(), "author")?;
        Self::validate_required(def.description.as_deref(), "description")?;

        for (name, host) in &def.hosts {
            Self::validate_host(def, name, host)?;
        }

        match &def.main {
            Some(main) if !def.hosts.contains_key(main) => {
                return Err(DepotError::validation(format!(
                    "main host \"{}\" does not exist",
                    main
                )));
            }
            None if !def.has_forwards() => {
                return Err(DepotError::validation(
                    "missing either \"main\" or forward directives",
                ));
            }
            _ => {}
        }

        Self::validate_forwards(def)
    }

    /// 验证必填字段
    pub fn validate_required(value: Option<&str>, field: &str) -> Result<()> {
        match value {
            Some(v) if !v.trim().is_empty() => Ok(()),
            _ => Err(DepotError::validation(format!(
                "missing required attribute \"{}\"",
                field
            ))),
        }
    }

    /// 验证单个主机
    pub fn validate_host(def: &TunnelDefinition, name: &str, host: &Host) -> Result<()> {
        for (field, value) in [("addr", &host.addr), ("user", &host.user)] {
            if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                return Err(DepotError::validation(format!(
                    "missing required attribute \"{}\" on host \"{}\"",
                    field, name
                )));
            }
        }

        match (&host.password, &host.key) {
            (None, None) => {
                return Err(DepotError::validation(format!(
                    "missing required attribute \"password\" or \"key\" on host \"{}\"",
                    name
                )))
            }
            (Some(_), Some(_)) => {
                return Err(DepotError::validation(format!(
                    "host \"{}\" must not have both \"password\" and \"key\"",
                    name
                )))
            }
            _ => {}
        }

        if host.socks.is_some() && host.via.is_some() {
            return Err(DepotError::validation(format!(
                "cannot combine \"socks\" and \"via\" on host \"{}\"",
                name
            )));
        }

        if let Some(via) = &host.via {
            if !def.hosts.contains_key(via) {
                return Err(DepotError::validation(format!(
                    "host \"{}\" is reached via nonexistent host \"{}\"",
                    name, via
                )));
            }
        }

        Ok(())
    }

    /// 验证端点格式
    pub fn validate_endpoint(endpoint: &Endpoint, role: &str) -> Result<()> {
        let text = endpoint.to_string();
        if !ENDPOINT_RE.is_match(&text) {
            return Err(DepotError::validation(format!(
                "malformed forward {} \"{}\"",
                role, text
            )));
        }
        Ok(())
    }

    /// 验证所有转发：端点格式与源端唯一
    pub fn validate_forwards(def: &TunnelDefinition) -> Result<()> {
        let mut seen = HashSet::new();
        for forward in def.all_forwards() {
            Self::validate_endpoint(&forward.from, "source")?;
            Self::validate_endpoint(&forward.to, "destination")?;
            if !seen.insert(&forward.from) {
                return Err(DepotError::validation(format!(
                    "duplicate forward source \"{}\"",
                    forward.from
                )));
            }
        }
        Ok(())
    }
}
