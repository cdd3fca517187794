/// 用户注册表
///
/// 用户以名称为键保存在 `users.json`。身份完全由客户端证书指纹决定，
/// 注册令牌只能使用一次。
use crate::store::JsonStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    /// 毫秒时间戳
    pub created: u64,
    pub fingerprint: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered: Option<u64>,
}

/// 生成新的一次性令牌
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn token_matches(user: &User, token: &str) -> bool {
    user.token
        .as_deref()
        .is_some_and(|t| t.as_bytes().ct_eq(token.as_bytes()).into())
}

pub struct UserRegistry {
    store: JsonStore<User>,
}

impl UserRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::open(path),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<User> {
        self.store.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.contains(name)
    }

    pub fn list(&self) -> Vec<User> {
        self.store.list_all().into_iter().map(|(_, u)| u).collect()
    }

    /// 按证书指纹查找用户（定长比较）
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Option<User> {
        let wanted = fingerprint.to_ascii_lowercase();
        self.store
            .find(|user| {
                user.fingerprint
                    .to_ascii_lowercase()
                    .as_bytes()
                    .ct_eq(wanted.as_bytes())
                    .into()
            })
            .map(|(_, user)| user)
    }

    /// 创建用户并分配新令牌；注册表为空时第一个用户自动成为管理员
    pub fn create(&self, name: &str, fingerprint: String, admin: bool) -> User {
        let user = User {
            name: name.to_string(),
            created: now_millis(),
            fingerprint,
            admin: admin || self.store.is_empty(),
            token: Some(new_token()),
            registered: None,
        };
        self.store.set(name, user.clone());
        user
    }

    /// 按未使用的令牌查找用户
    pub fn find_by_token(&self, token: &str) -> Option<User> {
        self.store
            .find(|user| token_matches(user, token))
            .map(|(_, user)| user)
    }

    /// 兑换令牌：查找与清除在同一把锁内完成，同一令牌只有一个调用者能成功
    pub fn take_token(&self, token: &str) -> Option<User> {
        self.store
            .find_and_update(
                |user| token_matches(user, token),
                |user| {
                    user.token = None;
                    user.registered = Some(now_millis());
                },
            )
            .map(|(_, user)| user)
    }

    /// 替换用户的令牌，旧令牌随即失效
    pub fn renew_token(&self, name: &str) -> Option<String> {
        let token = new_token();
        self.store
            .update(name, |user| user.token = Some(token.clone()))
            .map(|_| token)
    }

    pub fn delete(&self, name: &str) -> Option<User> {
        self.store.delete(name)
    }

    pub fn flush(&self) -> crate::error::Result<()> {
        self.store.flush()
    }
}
