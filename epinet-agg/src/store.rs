//! Aggregated epinet store
//!
//! Layout: `tenant → funnel → hour → HourlyEpinetData`, plus per-tenant
//! refresh metadata. Writes are last-writer-wins per hour key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use epinet_common::{HourKey, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::aggregate::HourlyEpinetData;

/// Per-tenant refresh bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TenantMeta {
    /// Current hour at the end of the last successful run
    pub last_full_hour: Option<HourKey>,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Storage interface for aggregated data
#[async_trait]
pub trait EpinetStore: Send + Sync {
    async fn get(&self, tenant: &str, funnel_id: &str, hour: HourKey)
        -> Result<Option<HourlyEpinetData>>;

    async fn put(
        &self,
        tenant: &str,
        funnel_id: &str,
        hour: HourKey,
        data: HourlyEpinetData,
    ) -> Result<()>;

    async fn delete(&self, tenant: &str, funnel_id: &str, hour: HourKey) -> Result<()>;

    /// Funnels with at least one stored hour
    async fn funnel_ids(&self, tenant: &str) -> Result<Vec<String>>;

    /// Stored hours for a funnel, oldest first
    async fn hour_keys(&self, tenant: &str, funnel_id: &str) -> Result<Vec<HourKey>>;

    async fn tenant_meta(&self, tenant: &str) -> Result<TenantMeta>;

    async fn set_tenant_meta(&self, tenant: &str, meta: TenantMeta) -> Result<()>;

    /// True when any funnel of the tenant has stored data
    async fn has_data(&self, tenant: &str) -> Result<bool> {
        Ok(!self.funnel_ids(tenant).await?.is_empty())
    }
}

#[derive(Debug, Default)]
struct TenantEntry {
    funnels: HashMap<String, BTreeMap<HourKey, HourlyEpinetData>>,
    meta: TenantMeta,
}

/// Process-local store, created empty at startup
#[derive(Debug, Default)]
pub struct MemoryStore {
    tenants: RwLock<HashMap<String, TenantEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EpinetStore for MemoryStore {
    async fn get(
        &self,
        tenant: &str,
        funnel_id: &str,
        hour: HourKey,
    ) -> Result<Option<HourlyEpinetData>> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant)
            .and_then(|t| t.funnels.get(funnel_id))
            .and_then(|hours| hours.get(&hour))
            .cloned())
    }

    async fn put(
        &self,
        tenant: &str,
        funnel_id: &str,
        hour: HourKey,
        data: HourlyEpinetData,
    ) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        tenants
            .entry(tenant.to_string())
            .or_default()
            .funnels
            .entry(funnel_id.to_string())
            .or_default()
            .insert(hour, data);
        Ok(())
    }

    async fn delete(&self, tenant: &str, funnel_id: &str, hour: HourKey) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        if let Some(entry) = tenants.get_mut(tenant) {
            if let Some(hours) = entry.funnels.get_mut(funnel_id) {
                hours.remove(&hour);
                if hours.is_empty() {
                    entry.funnels.remove(funnel_id);
                }
            }
        }
        Ok(())
    }

    async fn funnel_ids(&self, tenant: &str) -> Result<Vec<String>> {
        let tenants = self.tenants.read().await;
        let mut ids: Vec<String> = tenants
            .get(tenant)
            .map(|t| t.funnels.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn hour_keys(&self, tenant: &str, funnel_id: &str) -> Result<Vec<HourKey>> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant)
            .and_then(|t| t.funnels.get(funnel_id))
            .map(|hours| hours.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn tenant_meta(&self, tenant: &str) -> Result<TenantMeta> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(tenant).map(|t| t.meta).unwrap_or_default())
    }

    async fn set_tenant_meta(&self, tenant: &str, meta: TenantMeta) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        tenants.entry(tenant.to_string()).or_default().meta = meta;
        Ok(())
    }
}

/// Replace `hours` of one funnel with freshly aggregated data
///
/// Hours present in `fresh` are overwritten; hours absent from it are
/// deleted, so a rebuilt hour with no matches does not keep stale nodes.
pub async fn merge_funnel_hours(
    store: &dyn EpinetStore,
    tenant: &str,
    funnel_id: &str,
    hours: &[HourKey],
    mut fresh: BTreeMap<HourKey, HourlyEpinetData>,
) -> Result<()> {
    for hour in hours {
        match fresh.remove(hour) {
            Some(data) if !data.is_empty() => store.put(tenant, funnel_id, *hour, data).await?,
            _ => store.delete(tenant, funnel_id, *hour).await?,
        }
    }
    Ok(())
}

/// Delete every stored hour of `tenant` not in `window`
///
/// Returns the number of hour buckets removed.
pub async fn trim_outside_window(
    store: &dyn EpinetStore,
    tenant: &str,
    window: &BTreeSet<HourKey>,
) -> Result<usize> {
    let mut removed = 0;
    for funnel_id in store.funnel_ids(tenant).await? {
        for hour in store.hour_keys(tenant, &funnel_id).await? {
            if !window.contains(&hour) {
                store.delete(tenant, &funnel_id, hour).await?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
