//! Refresh planning
//!
//! Decides between a current-hour rebuild and a full-range backfill, and
//! splits the chosen hours into chunks (recent first).

use chrono::{DateTime, Utc};
use epinet_common::events::RunMode;
use epinet_common::hour_key::{current_hour_key, hour_keys_for_range};
use epinet_common::HourKey;

use crate::store::TenantMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPlan {
    pub mode: RunMode,
    /// Number of hours ending at the current hour to reprocess
    pub hours: usize,
}

impl RefreshPlan {
    pub fn current_hour() -> Self {
        Self {
            mode: RunMode::CurrentHour,
            hours: 1,
        }
    }

    pub fn full_range(hours: usize) -> Self {
        Self {
            mode: RunMode::FullRange,
            hours,
        }
    }

    /// Hours covered by this plan, newest first
    pub fn hour_keys(&self, now: DateTime<Utc>) -> Vec<HourKey> {
        hour_keys_for_range(now, self.hours)
    }
}

/// Choose a plan for a tenant
///
/// - no stored data, or no recorded last full hour: full range of `max_hours`
/// - last full hour behind the current hour: full range from that hour
///   through now (it was still open when last processed), capped at
///   `max_hours`
/// - otherwise: current hour only
pub fn plan_refresh(
    has_data: bool,
    meta: &TenantMeta,
    now: DateTime<Utc>,
    max_hours: usize,
) -> RefreshPlan {
    let Some(last_full_hour) = meta.last_full_hour.filter(|_| has_data) else {
        return RefreshPlan::full_range(max_hours);
    };

    let gap = last_full_hour.hours_until(&current_hour_key(now));
    if gap <= 0 {
        return RefreshPlan::current_hour();
    }
    let hours = usize::try_from(gap + 1).unwrap_or(usize::MAX).min(max_hours);
    RefreshPlan::full_range(hours)
}

/// Split newest-first `keys` into a recent chunk followed by historical chunks
pub fn chunk_hour_keys(keys: &[HourKey], recent: usize, historical: usize) -> Vec<Vec<HourKey>> {
    let recent = recent.max(1).min(keys.len());
    let (head, rest) = keys.split_at(recent);

    let mut chunks = Vec::new();
    if !head.is_empty() {
        chunks.push(head.to_vec());
    }
    chunks.extend(rest.chunks(historical.max(1)).map(<[HourKey]>::to_vec));
    chunks
}
