/// JSON 键值存储
///
/// 整个存储是一个 JSON 文档。修改后在 200ms 窗口内合并写盘，
/// 只保留一个待执行的写任务；`flush()` 取消该任务并同步写入。
/// 单写者假设：同一文件在一个进程内只能有一个实例。
use crate::error::Result;
use anyhow::Context;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// 写盘合并窗口
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(200);

struct StoreState<V> {
    items: BTreeMap<String, V>,
    pending: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct JsonStore<V> {
    path: PathBuf,
    state: Arc<Mutex<StoreState<V>>>,
}

impl<V> JsonStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// 打开存储；文件不存在或损坏时从空存储开始
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(items) => items,
                Err(e) => {
                    warn!("Store {:?} is unreadable, starting empty: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        Self {
            path,
            state: Arc::new(Mutex::new(StoreState {
                items,
                pending: None,
                generation: 0,
            })),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.state.lock().items.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().items.contains_key(key)
    }

    /// 插入或覆盖
    pub fn set(&self, key: impl Into<String>, value: V) {
        let mut state = self.state.lock();
        state.items.insert(key.into(), value);
        self.schedule_save(&mut state);
    }

    /// 原地修改已有条目，返回修改后的值
    pub fn update<F>(&self, key: &str, f: F) -> Option<V>
    where
        F: FnOnce(&mut V),
    {
        let mut state = self.state.lock();
        let updated = state.items.get_mut(key).map(|value| {
            f(value);
            value.clone()
        })?;
        self.schedule_save(&mut state);
        Some(updated)
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        let removed = state.items.remove(key)?;
        self.schedule_save(&mut state);
        Some(removed)
    }

    pub fn list_all(&self) -> Vec<(String, V)> {
        self.state
            .lock()
            .items
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// 查找第一个满足条件的条目
    pub fn find<P>(&self, mut predicate: P) -> Option<(String, V)>
    where
        P: FnMut(&V) -> bool,
    {
        self.state
            .lock()
            .items
            .iter()
            .find(|(_, v)| predicate(v))
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// 查找第一个满足条件的条目并原地修改，查找与修改在同一把锁内完成
    pub fn find_and_update<P, F>(&self, mut predicate: P, f: F) -> Option<(String, V)>
    where
        P: FnMut(&V) -> bool,
        F: FnOnce(&mut V),
    {
        let mut state = self.state.lock();
        let (key, value) = state.items.iter_mut().find(|(_, v)| predicate(v))?;
        f(value);
        let found = (key.clone(), value.clone());
        self.schedule_save(&mut state);
        Some(found)
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// 取消待写任务并立即写盘
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(handle) = state.pending.take() {
            handle.abort();
        }
        state.generation += 1;
        write_snapshot(&self.path, &state.items)
    }

    fn schedule_save(&self, state: &mut StoreState<V>) {
        if let Some(handle) = state.pending.take() {
            handle.abort();
        }
        state.generation += 1;

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                if let Err(e) = write_snapshot(&self.path, &state.items) {
                    error!("Failed to save store {:?}: {}", self.path, e);
                }
                return;
            }
        };

        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        let path = self.path.clone();
        state.pending = Some(runtime.spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            let mut state = shared.lock();
            if state.generation != generation {
                return;
            }
            state.pending = None;
            if let Err(e) = write_snapshot(&path, &state.items) {
                error!("Failed to save store {:?}: {}", path, e);
            }
        }));
    }
}

/// 先写 `.part` 临时文件再原子重命名
fn write_snapshot<V: Serialize>(path: &Path, items: &BTreeMap<String, V>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(items)?;
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    std::fs::write(&part, &bytes).with_context(|| format!("Failed to write {:?}", part))?;
    std::fs::rename(&part, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", part, path))?;
    debug!("Saved {} entries to {:?}", items.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
    }

    fn read_back(path: &Path) -> BTreeMap<String, Entry> {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_writes_are_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let store: JsonStore<Entry> = JsonStore::open(&path);

        store.set("a", Entry { n: 1 });
        store.set("b", Entry { n: 2 });
        store.set("a", Entry { n: 3 });
        assert!(!path.exists());

        tokio::time::sleep(SAVE_DEBOUNCE * 3).await;
        let saved = read_back(&path);
        assert_eq!(saved.len(), 2);
        assert_eq!(saved["a"], Entry { n: 3 });
    }

    #[tokio::test]
    async fn test_flush_writes_immediately_and_cancels_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let store: JsonStore<Entry> = JsonStore::open(&path);

        store.set("a", Entry { n: 1 });
        store.flush().unwrap();
        assert_eq!(read_back(&path).len(), 1);

        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(SAVE_DEBOUNCE * 3).await;
        assert!(!path.exists());
    }

    #[test]
    fn test_without_runtime_writes_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        let store: JsonStore<Entry> = JsonStore::open(&path);

        store.set("a", Entry { n: 7 });
        assert_eq!(read_back(&path)["a"], Entry { n: 7 });

        assert_eq!(store.delete("a"), Some(Entry { n: 7 }));
        assert!(read_back(&path).is_empty());
        assert_eq!(store.delete("a"), None);
    }

    #[test]
    fn test_reopen_and_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        {
            let store: JsonStore<Entry> = JsonStore::open(&path);
            store.set("x", Entry { n: 1 });
        }
        let store: JsonStore<Entry> = JsonStore::open(&path);
        assert_eq!(store.get("x"), Some(Entry { n: 1 }));

        std::fs::write(&path, b"{ not json").unwrap();
        let store: JsonStore<Entry> = JsonStore::open(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_find_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Entry> = JsonStore::open(dir.path().join("s.json"));
        store.set("a", Entry { n: 1 });
        store.set("b", Entry { n: 2 });

        let (key, _) = store.find(|e| e.n == 2).unwrap();
        assert_eq!(key, "b");

        let (key, updated) = store.find_and_update(|e| e.n == 2, |e| e.n = 4).unwrap();
        assert_eq!((key.as_str(), updated.n), ("b", 4));
        assert!(store.find_and_update(|e| e.n == 2, |e| e.n = 9).is_none());

        let updated = store.update("b", |e| e.n = 5).unwrap();
        assert_eq!(updated.n, 5);
        assert!(store.update("zzz", |e| e.n = 0).is_none());
        assert_eq!(store.list_all().len(), 2);
    }
}
