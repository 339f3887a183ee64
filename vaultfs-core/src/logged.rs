//! Request logging around any [`SecretStore`].

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{info, warn};

use crate::{MountInfo, SecretData, SecretStore, StoreError};

/// Logs every remote call (method and path, never values) before
/// delegating to the wrapped store.
///
/// The daemon wraps its client in this when request logging is enabled, so
/// the verbosity decision is made once at construction.
#[derive(Debug)]
pub struct LoggedStore<S> {
    inner: S,
}

impl<S: SecretStore> LoggedStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn finish<T>(call: &str, started: Instant, result: &Result<T, StoreError>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(_) => info!(elapsed_ms, "{call}"),
        Err(e) => warn!(elapsed_ms, error = %e, "{call} failed"),
    }
}

#[async_trait::async_trait]
impl<S: SecretStore> SecretStore for LoggedStore<S> {
    async fn list_mounts(&self) -> Result<BTreeMap<String, MountInfo>, StoreError> {
        let started = Instant::now();
        let result = self.inner.list_mounts().await;
        finish("ListMounts()", started, &result);
        result
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let started = Instant::now();
        let result = self.inner.list(path).await;
        finish(&format!("List({path})"), started, &result);
        result
    }

    async fn read(&self, path: &str) -> Result<SecretData, StoreError> {
        let started = Instant::now();
        let result = self.inner.read(path).await;
        finish(&format!("Read({path})"), started, &result);
        result
    }

    async fn write(&self, path: &str, data: SecretData) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = self.inner.write(path, data).await;
        finish(&format!("Write({path})"), started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn delegates_every_call() {
        let logged = LoggedStore::new(MemoryStore::dev_server());
        assert_eq!(logged.list_mounts().await.unwrap().len(), 4);
        assert!(logged.list("secret/metadata").await.unwrap().is_empty());
        assert!(logged.read("secret/data/missing").await.is_err());

        let inner = logged.into_inner();
        assert_eq!(
            inner.calls(),
            [
                "ListMounts()",
                "List(secret/metadata)",
                "Read(secret/data/missing)",
            ]
        );
    }

    #[tokio::test]
    async fn errors_pass_through_unchanged() {
        let store = MemoryStore::new();
        store.fail_next("offline");
        let logged = LoggedStore::new(store);
        assert!(matches!(
            logged.list("kv").await,
            Err(StoreError::Unavailable(msg)) if msg == "offline"
        ));
    }
}
