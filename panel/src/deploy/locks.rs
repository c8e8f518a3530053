//! Per-site leases

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::models::deployment::SiteId;

type LeaseTable = DashMap<SiteId, Arc<Mutex<()>>>;

/// Exclusive hold on a site's release area, released on drop
#[derive(Debug)]
pub struct SiteLease {
    site_id: SiteId,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LeaseTable>,
}

impl Drop for SiteLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still references an idle lock.
        self.table
            .remove_if(&self.site_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Lease table keyed by site. Distinct sites never contend.
#[derive(Debug, Default)]
pub struct SiteLocks {
    table: Arc<LeaseTable>,
}

impl SiteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, site_id: SiteId) -> Arc<Mutex<()>> {
        self.table.entry(site_id).or_default().value().clone()
    }

    fn lease(&self, site_id: SiteId, guard: OwnedMutexGuard<()>) -> SiteLease {
        SiteLease {
            site_id,
            guard: Some(guard),
            table: self.table.clone(),
        }
    }

    /// Wait for exclusive access to `site_id`
    pub async fn acquire(&self, site_id: SiteId) -> SiteLease {
        let lock = self.lock_for(site_id);
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Waiting for lease on site {}", site_id);
                lock.lock_owned().await
            }
        };
        self.lease(site_id, guard)
    }

    /// Take the lease only if nobody holds it
    pub fn try_acquire(&self, site_id: SiteId) -> Option<SiteLease> {
        let guard = self.lock_for(site_id).try_lock_owned().ok()?;
        Some(self.lease(site_id, guard))
    }
}
