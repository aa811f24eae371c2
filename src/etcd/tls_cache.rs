//! Process-wide cache of cluster TLS configurations keyed by secret identity.
//!
//! Entries are invalidated by the secret's resourceVersion; construction is
//! single-flight so concurrent reconciles for the same (key, version) share
//! one secret fetch and one TLS build. Failures are cached on the entry until
//! eviction or a version change.

use std::num::NonZeroUsize;
use std::sync::Arc;

use etcd_client::TlsOptions;
use k8s_openapi::api::core::v1::Secret;
use kube::core::PartialObjectMeta;
use kube::Api;
use lru::LruCache;
use tokio::sync::{Mutex, OnceCell};

use super::credentials::Credentials;
use super::{Error, Result};

/// Secret identity: (namespace, name)
pub type SecretKey = (String, String);

pub struct TlsCache {
    client: kube::Client,
    entries: Mutex<LruCache<SecretKey, Arc<CacheEntry>>>,
}

struct CacheEntry {
    version: String,
    cell: OnceCell<std::result::Result<TlsOptions, Arc<Error>>>,
}

impl TlsCache {
    pub fn new(client: kube::Client, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            client,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolve the TLS options for the secret at `key`.
    ///
    /// All successful concurrent callers for the same secret version receive
    /// the same constructed configuration.
    pub async fn get(&self, key: &SecretKey) -> Result<TlsOptions> {
        let (namespace, name) = key;

        // partial metadata fetch to learn the current resource version
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let meta: PartialObjectMeta<Secret> = api.get_metadata(name).await?;
        let version = meta.metadata.resource_version.unwrap_or_default();

        let entry = self.entry(key, version).await;

        let client = self.client.clone();
        let result = entry
            .cell
            .get_or_init(|| async move {
                let credentials = Credentials::load_secret(client, namespace, name)
                    .await
                    .map_err(Arc::new)?;
                credentials.tls_options().map_err(Arc::new)
            })
            .await;

        match result {
            Ok(tls) => Ok(tls.clone()),
            Err(err) => Err(Error::Shared(err.clone())),
        }
    }

    async fn entry(&self, key: &SecretKey, version: String) -> Arc<CacheEntry> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            if entry.version == version {
                return entry.clone();
            }
        }

        let entry = Arc::new(CacheEntry {
            version,
            cell: OnceCell::new(),
        });
        entries.put(key.clone(), entry.clone());

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn entry_initializes_once_per_version() {
        let entry = Arc::new(CacheEntry {
            version: "1".to_string(),
            cell: OnceCell::new(),
        });
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let entry = entry.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                entry
                    .cell
                    .get_or_init(|| async {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok(TlsOptions::new())
                    })
                    .await
                    .is_ok()
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_caches_failure() {
        let entry = CacheEntry {
            version: "1".to_string(),
            cell: OnceCell::new(),
        };

        let first = entry
            .cell
            .get_or_init(|| async { Err(Arc::new(Error::MissingKeyPair)) })
            .await;
        assert!(first.is_err());

        // initializer does not run again, the failure is the entry's value
        let second = entry
            .cell
            .get_or_init(|| async { Ok(TlsOptions::new()) })
            .await;
        assert!(second.is_err());
    }
}
