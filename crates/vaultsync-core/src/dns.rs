//! Name resolution with a persistent cache
//!
//! The actual lookup (DNS TXT records, well-known files, whatever the
//! host wires in) is an opaque async callback; this module owns only the
//! caching and the error contract: any lookup failure surfaces as
//! `InvalidDomainName`. Raw 64-hex names bypass both the cache and the
//! lookup.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{VaultError, VaultResult};
use crate::storage::VaultDb;
use crate::types::VaultKey;

/// Host-supplied async name→key lookup
pub type LookupFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Cached resolver over a host-supplied lookup
#[derive(Clone)]
pub struct NameResolver {
    db: VaultDb,
    lookup: LookupFn,
}

impl NameResolver {
    pub fn new(db: VaultDb, lookup: LookupFn) -> Self {
        Self { db, lookup }
    }

    /// Resolve a name to a vault key.
    ///
    /// # Errors
    ///
    /// `InvalidDomainName` when the lookup fails or returns a malformed
    /// key.
    pub async fn resolve_name(&self, name: &str) -> VaultResult<VaultKey> {
        // raw keys pass straight through, never cached
        if let Ok(key) = VaultKey::parse(name) {
            return Ok(key);
        }

        if let Some(cached) = self.db.name_cache_get(name)? {
            if let Ok(key) = VaultKey::parse(&cached) {
                debug!(name, "Resolved from name cache");
                return Ok(key);
            }
        }

        let resolved = (self.lookup)(name.to_string())
            .await
            .map_err(|_| VaultError::InvalidDomainName(name.to_string()))?;
        let key = VaultKey::parse(&resolved)
            .map_err(|_| VaultError::InvalidDomainName(name.to_string()))?;

        self.db.name_cache_put(name, &key.to_hex())?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn resolver_with(
        temp: &TempDir,
        lookup: LookupFn,
    ) -> NameResolver {
        let db = VaultDb::new(temp.path().join("db.redb")).unwrap();
        NameResolver::new(db, lookup)
    }

    #[tokio::test]
    async fn test_raw_key_bypasses_lookup() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver_with(
            &temp,
            Arc::new(|_| Box::pin(async { Err("no lookup expected".to_string()) })),
        );
        let hex = "ab".repeat(32);
        assert_eq!(resolver.resolve_name(&hex).await.unwrap().to_hex(), hex);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_invalid_domain() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver_with(
            &temp,
            Arc::new(|_| Box::pin(async { Err("nxdomain".to_string()) })),
        );
        assert!(matches!(
            resolver.resolve_name("nope.example").await,
            Err(VaultError::InvalidDomainName(_))
        ));
    }

    #[tokio::test]
    async fn test_second_resolution_hits_cache() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let hex = "cd".repeat(32);
        let answer = hex.clone();
        let resolver = resolver_with(
            &temp,
            Arc::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                let answer = answer.clone();
                Box::pin(async move { Ok(answer) })
            }),
        );

        assert_eq!(
            resolver.resolve_name("site.example").await.unwrap().to_hex(),
            hex
        );
        assert_eq!(
            resolver.resolve_name("site.example").await.unwrap().to_hex(),
            hex
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_lookup_answer_is_invalid_domain() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver_with(
            &temp,
            Arc::new(|_| Box::pin(async { Ok("not-a-key".to_string()) })),
        );
        assert!(matches!(
            resolver.resolve_name("weird.example").await,
            Err(VaultError::InvalidDomainName(_))
        ));
    }
}
