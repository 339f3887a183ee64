//! In-process [`SecretStore`] for tests.
//!
//! Emulates what the tree can observe of a Vault dev server: the default
//! mount table, the KV v1 layout (values stored at their logical path) and
//! the KV v2 layout (writes under `data/` wrapped in `{"data": ..}`, listings
//! under `metadata/`, reads returning a versioned envelope).  Every call is
//! recorded so tests can assert on request patterns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};

use crate::adjust::join_path;
use crate::{MountInfo, SEPARATOR, SecretData, SecretStore, StoreError};

#[derive(Debug)]
struct Stored {
    value: Value,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    mounts: BTreeMap<String, MountInfo>,
    /// Keyed by `<mount>/<logical path>`.
    entries: BTreeMap<String, Stored>,
    calls: Vec<String>,
    fail_next: Option<String>,
}

/// Where a physical path lands.
struct Located {
    mount: String,
    versioned: bool,
    /// Path below the mount, without leading or trailing separators.
    rest: String,
}

impl Inner {
    fn locate(&self, path: &str) -> Option<Located> {
        let path = join_path(&[path]);
        self.mounts
            .iter()
            .filter_map(|(mount_path, info)| {
                let name = mount_path.trim_end_matches(SEPARATOR);
                let rest = if path == name {
                    ""
                } else {
                    path.strip_prefix(mount_path.as_str())?
                };
                Some(Located {
                    mount: name.to_string(),
                    versioned: info.engine_type == "kv"
                        && info.options.get("version").map(String::as_str) == Some("2"),
                    rest: rest.to_string(),
                })
            })
            .max_by_key(|located| located.mount.len())
    }

    fn begin(&mut self, call: String) -> Result<(), StoreError> {
        self.calls.push(call);
        match self.fail_next.take() {
            Some(msg) => Err(StoreError::Unavailable(msg)),
            None => Ok(()),
        }
    }
}

/// Strip `prefix` as a whole leading path segment.
fn strip_segment<'a>(rest: &'a str, prefix: &str) -> Option<&'a str> {
    if rest == prefix {
        return Some("");
    }
    rest.strip_prefix(prefix)?.strip_prefix(SEPARATOR)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// A store with no mounts at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose mount table matches a freshly started dev server.
    pub fn dev_server() -> Self {
        let store = Self::new();
        store.mount("cubbyhole", MountInfo::new("cubbyhole"));
        store.mount("identity", MountInfo::new("identity"));
        store.mount("secret", MountInfo::new("kv").with_option("version", "2"));
        store.mount("sys", MountInfo::new("system"));
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enable a secret engine at `name`.  Not recorded as a call.
    pub fn mount(&self, name: &str, info: MountInfo) {
        let key = format!("{}{SEPARATOR}", name.trim_end_matches(SEPARATOR));
        self.lock().mounts.insert(key, info);
    }

    /// Calls made so far, e.g. `List(kv/metadata)`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Make the next call fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, msg: &str) {
        self.lock().fail_next = Some(msg.to_string());
    }

    /// Drop the secret at `<mount>/<logical path>`.  Not recorded as a call.
    pub fn remove(&self, logical: &str) -> bool {
        self.lock().entries.remove(&join_path(&[logical])).is_some()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl SecretStore for MemoryStore {
    async fn list_mounts(&self) -> Result<BTreeMap<String, MountInfo>, StoreError> {
        let mut inner = self.lock();
        inner.begin("ListMounts()".to_string())?;
        Ok(inner.mounts.clone())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        inner.begin(format!("List({path})"))?;

        let Some(located) = inner.locate(path) else {
            return Ok(Vec::new());
        };
        let logical = if located.versioned {
            match strip_segment(&located.rest, "metadata") {
                Some(logical) => logical,
                None => return Ok(Vec::new()),
            }
        } else {
            located.rest.as_str()
        };

        let prefix = format!("{}{SEPARATOR}", join_path(&[&located.mount, logical]));
        let names: BTreeSet<String> = inner
            .entries
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .map(|remainder| match remainder.split_once(SEPARATOR) {
                Some((dir, _)) => format!("{dir}{SEPARATOR}"),
                None => remainder.to_string(),
            })
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn read(&self, path: &str) -> Result<SecretData, StoreError> {
        let mut inner = self.lock();
        inner.begin(format!("Read({path})"))?;

        let not_found = || StoreError::NotFound(path.to_string());
        let located = inner.locate(path).ok_or_else(not_found)?;

        if located.versioned {
            let logical = strip_segment(&located.rest, "data").ok_or_else(not_found)?;
            let stored = inner
                .entries
                .get(&join_path(&[&located.mount, logical]))
                .ok_or_else(not_found)?;
            let envelope = json!({
                "data": stored.value,
                "metadata": {
                    "created_time": "2024-01-01T00:00:00Z",
                    "custom_metadata": null,
                    "deletion_time": "",
                    "destroyed": false,
                    "version": stored.version,
                }
            });
            match envelope {
                Value::Object(map) => Ok(map),
                _ => Err(StoreError::Malformed("envelope is not an object".into())),
            }
        } else {
            match inner.entries.get(&join_path(&[path])) {
                Some(Stored {
                    value: Value::Object(map),
                    ..
                }) => Ok(map.clone()),
                Some(_) => Err(StoreError::Malformed(format!("{path} is not an object"))),
                None => Err(not_found()),
            }
        }
    }

    async fn write(&self, path: &str, mut data: SecretData) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.begin(format!("Write({path})"))?;

        let located = inner.locate(path).ok_or_else(|| StoreError::Api {
            status: 404,
            message: format!("no handler for route \"{path}\""),
        })?;

        let (key, value) = if located.versioned {
            let logical = strip_segment(&located.rest, "data")
                .filter(|l| !l.is_empty())
                .ok_or_else(|| StoreError::Api {
                    status: 405,
                    message: format!("unsupported path \"{path}\""),
                })?;
            let value = data.remove("data").ok_or_else(|| StoreError::Api {
                status: 400,
                message: "no data provided".into(),
            })?;
            (join_path(&[&located.mount, logical]), value)
        } else {
            (join_path(&[path]), Value::Object(data))
        };

        let version = inner.entries.get(&key).map_or(1, |s| s.version + 1);
        inner.entries.insert(key, Stored { value, version });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: Value) -> SecretData {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn v2_layout_is_split() {
        let store = MemoryStore::dev_server();
        store
            .write("secret/data/a/b", data(json!({"data": {"x": 1}})))
            .await
            .unwrap();

        assert_eq!(store.list("secret/metadata").await.unwrap(), ["a/"]);
        assert_eq!(store.list("secret/metadata/a").await.unwrap(), ["b"]);
        // Nothing lives at the logical path itself.
        assert!(store.list("secret/a").await.unwrap().is_empty());

        let raw = store.read("secret/data/a/b").await.unwrap();
        assert_eq!(raw["data"], json!({"x": 1}));
        assert_eq!(raw["metadata"]["version"], json!(1));
        assert!(matches!(
            store.read("secret/a/b").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn v2_versions_increment() {
        let store = MemoryStore::dev_server();
        for n in 0..3 {
            store
                .write("secret/data/k", data(json!({"data": {"n": n}})))
                .await
                .unwrap();
        }
        let raw = store.read("secret/data/k").await.unwrap();
        assert_eq!(raw["metadata"]["version"], json!(3));
        assert_eq!(raw["data"], json!({"n": 2}));
    }

    #[tokio::test]
    async fn v2_write_requires_data_field() {
        let store = MemoryStore::dev_server();
        let err = store
            .write("secret/data/k", data(json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Api { status: 400, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn v1_layout_is_flat() {
        let store = MemoryStore::new();
        store.mount("kv", MountInfo::new("kv"));
        store.write("kv/x/y", data(json!({"a": 1}))).await.unwrap();
        store.write("kv/z", data(json!({"b": 2}))).await.unwrap();

        assert_eq!(store.list("kv").await.unwrap(), ["x/", "z"]);
        assert_eq!(store.list("kv/").await.unwrap(), ["x/", "z"]);
        assert_eq!(store.read("kv/x/y").await.unwrap(), data(json!({"a": 1})));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn unmounted_paths() {
        let store = MemoryStore::new();
        assert!(store.list("nowhere").await.unwrap().is_empty());
        assert!(matches!(
            store.write("nowhere/x", SecretData::new()).await,
            Err(StoreError::Api { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn calls_are_recorded_and_failures_are_one_shot() {
        let store = MemoryStore::dev_server();
        store.fail_next("boom");
        assert!(store.list_mounts().await.is_err());
        assert_eq!(store.list_mounts().await.unwrap().len(), 4);
        assert_eq!(store.calls(), ["ListMounts()", "ListMounts()"]);
    }
}
