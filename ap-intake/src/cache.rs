//! Read-through vendor cache.
//!
//! Vendor lookups are read-heavy and the vendor master changes rarely,
//! so a short TTL cache sits in front of `repos::vendor_repo`. Writes
//! (create/deactivate) invalidate the relevant key directly rather than
//! waiting out the TTL, so operators see administrative changes take
//! effect immediately.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sqlx::PgPool;

use crate::repos::vendor_repo::{self, VendorError, VendorRow};

const DEFAULT_TTL_SECS: u64 = 3600;
const MAX_CAPACITY: u64 = 10_000;

#[derive(Clone)]
pub struct VendorCache {
    inner: Cache<String, Option<Arc<VendorRow>>>,
}

impl VendorCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(MAX_CAPACITY)
                .time_to_live(Duration::from_secs(ttl_secs))
                .build(),
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL_SECS)
    }

    /// Fetch a vendor by key, consulting the cache first and falling
    /// back to the store on a miss. Negative lookups (no such vendor)
    /// are cached too, so a storm of unmatched sender domains doesn't
    /// repeatedly hit the database.
    pub async fn lookup(
        &self,
        pool: &PgPool,
        vendor_key: &str,
    ) -> Result<Option<Arc<VendorRow>>, VendorError> {
        if let Some(hit) = self.inner.get(vendor_key).await {
            return Ok(hit);
        }

        let row = vendor_repo::lookup(pool, vendor_key).await?.map(Arc::new);
        self.inner.insert(vendor_key.to_string(), row.clone()).await;
        Ok(row)
    }

    pub async fn invalidate(&self, vendor_key: &str) {
        self.inner.invalidate(vendor_key).await;
    }
}

impl Default for VendorCache {
    fn default() -> Self {
        Self::with_default_ttl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn negative_lookup_caches_absence() {
        let cache = VendorCache::new(60);
        cache.inner.insert("acme-co".to_string(), None).await;
        let hit = cache.inner.get("acme-co").await;
        assert_eq!(hit, Some(None));
    }

    #[tokio::test]
    async fn invalidate_clears_entry() {
        let cache = VendorCache::new(60);
        cache
            .inner
            .insert(
                "acme-co".to_string(),
                Some(Arc::new(VendorRow {
                    vendor_key: "acme-co".to_string(),
                    vendor_name: "Acme Co".to_string(),
                    expense_dept: None,
                    gl_code: None,
                    allocation_schedule: None,
                    billing_party: None,
                    active: true,
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                    product_category: None,
                    venue_required: None,
                })),
            )
            .await;
        cache.invalidate("acme-co").await;
        assert!(cache.inner.get("acme-co").await.is_none());
    }
}
