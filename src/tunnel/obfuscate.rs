use super::TunnelDefinition;
use crate::error::Result;
use async_trait::async_trait;

/// 密文引用前缀，后跟密钥库中的 id
pub const SECRET_TAG: &str = "$depot$";

/// 需要替换为引用的字段
const SECRET_FIELDS: &[&str] = &["password", "key", "Xauth_password", "IPSec_secret"];

/// 按 id 解析密文引用
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<String>;
}

/// 若值是密文引用则返回其 id
pub fn reference_id(value: &str) -> Option<&str> {
    value.strip_prefix(SECRET_TAG)
}

fn secret_slots(def: &mut TunnelDefinition) -> Vec<&mut String> {
    let mut slots = Vec::new();
    for host in def.hosts.values_mut() {
        slots.extend(host.password.as_mut());
        slots.extend(host.key.as_mut());
    }
    if let Some(vpn) = def.vpn.as_mut() {
        for (key, value) in vpn.settings.iter_mut() {
            if SECRET_FIELDS.contains(&key.as_str()) {
                slots.push(value);
            }
        }
    }
    slots
}

/// 将明文密钥替换为引用
///
/// `stash` 负责保存明文并返回新 id；已经是引用的值保持不变。返回替换数量。
pub fn obfuscate<F>(def: &mut TunnelDefinition, mut stash: F) -> usize
where
    F: FnMut(String) -> String,
{
    let mut replaced = 0;
    for slot in secret_slots(def) {
        if reference_id(slot).is_some() {
            continue;
        }
        let plain = std::mem::take(slot);
        *slot = format!("{}{}", SECRET_TAG, stash(plain));
        replaced += 1;
    }
    replaced
}

/// 将引用还原为明文
pub async fn unveil(def: &mut TunnelDefinition, resolver: &dyn KeyResolver) -> Result<usize> {
    let mut restored = 0;
    for slot in secret_slots(def) {
        let Some(id) = reference_id(slot) else {
            continue;
        };
        let plain = resolver.resolve(id).await?;
        *slot = plain;
        restored += 1;
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::super::{parse, VpnKind};
    use super::*;
    use crate::error::DepotError;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemoryKeys(Mutex<HashMap<String, String>>);

    #[async_trait]
    impl KeyResolver for MemoryKeys {
        async fn resolve(&self, id: &str) -> Result<String> {
            self.0
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| DepotError::not_found(id.to_string()))
        }
    }

    const TEXT: &str = "\
[general]
version = 3.2
author = a
description = d
main = gw

[hosts.gw]
addr = 192.0.2.1
user = root
password = hunter2

[vpnc]
IPSec_gateway = 198.51.100.1
IPSec_secret = shared
Xauth_password = xauth
";

    #[tokio::test]
    async fn test_obfuscate_then_unveil() {
        let original = parse(TEXT).unwrap();
        let mut def = original.clone();
        let keys = MemoryKeys(Mutex::new(HashMap::new()));

        let mut counter = 0;
        let replaced = obfuscate(&mut def, |plain| {
            counter += 1;
            let id = format!("id{}", counter);
            keys.0.lock().insert(id.clone(), plain);
            id
        });
        assert_eq!(replaced, 3);

        let gw = &def.hosts["gw"];
        assert_eq!(gw.password.as_deref(), Some("$depot$id1"));
        let vpn = def.vpn.as_ref().unwrap();
        assert_eq!(vpn.kind, VpnKind::Vpnc);
        assert_eq!(vpn.settings[0].1, "198.51.100.1");

        let restored = unveil(&mut def, &keys).await.unwrap();
        assert_eq!(restored, 3);
        assert_eq!(def, original);
    }

    #[test]
    fn test_obfuscate_is_idempotent() {
        let mut def = parse(TEXT).unwrap();
        let first = obfuscate(&mut def, |_| "x".to_string());
        let second = obfuscate(&mut def, |_| "y".to_string());
        assert_eq!(first, 3);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_unveil_unknown_reference_fails() {
        let mut def = parse(TEXT).unwrap();
        obfuscate(&mut def, |_| "gone".to_string());
        let keys = MemoryKeys(Mutex::new(HashMap::new()));
        assert!(unveil(&mut def, &keys).await.unwrap_err().is_not_found());
    }
}
