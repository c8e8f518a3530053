//! Slot rotation for activation and rollback

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::errors::{DeployError, PanelError, SwapStep};
use crate::models::deployment::SiteId;
use crate::storage::layout::{SitesLayout, Slot};

/// Atomic substitution of one named slot by another
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Whether the slot currently holds a release
    async fn exists(&self, site_id: SiteId, slot: Slot) -> bool;

    /// Discard a slot. Removing an absent slot succeeds.
    async fn remove(&self, site_id: SiteId, slot: Slot) -> Result<(), PanelError>;

    /// Move `from` into `to` in one step. `to` must be absent.
    async fn substitute(&self, site_id: SiteId, from: Slot, to: Slot) -> Result<(), PanelError>;
}

/// Slot store on a local filesystem, backed by directory renames
#[derive(Debug, Clone)]
pub struct FsSlotStore {
    layout: SitesLayout,
}

impl FsSlotStore {
    pub fn new(layout: SitesLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl SlotStore for FsSlotStore {
    async fn exists(&self, site_id: SiteId, slot: Slot) -> bool {
        self.layout.site(site_id).slot(slot).exists().await
    }

    async fn remove(&self, site_id: SiteId, slot: Slot) -> Result<(), PanelError> {
        self.layout.site(site_id).slot(slot).delete().await
    }

    async fn substitute(&self, site_id: SiteId, from: Slot, to: Slot) -> Result<(), PanelError> {
        let site = self.layout.site(site_id);
        site.slot(from).rename_to(&site.slot(to)).await
    }
}

/// Rotates `staging`, `current` and `previous` of a site.
///
/// Callers must hold the site's lease.
#[derive(Clone)]
pub struct ReleaseSwapper {
    store: Arc<dyn SlotStore>,
}

impl ReleaseSwapper {
    pub fn new(store: Arc<dyn SlotStore>) -> Self {
        Self { store }
    }

    /// Promote the staged release to `current`, keeping the old one as `previous`
    pub async fn activate(&self, site_id: SiteId) -> Result<(), DeployError> {
        self.store
            .remove(site_id, Slot::Previous)
            .await
            .map_err(|e| DeployError::activation(SwapStep::DiscardPrevious, e))?;

        let had_current = self.store.exists(site_id, Slot::Current).await;
        if had_current {
            self.store
                .substitute(site_id, Slot::Current, Slot::Previous)
                .await
                .map_err(|e| DeployError::activation(SwapStep::BackupCurrent, e))?;
        }

        if let Err(e) = self
            .store
            .substitute(site_id, Slot::Staging, Slot::Current)
            .await
        {
            error!("Failed to promote staging for site {}: {}", site_id, e);
            if had_current {
                match self
                    .store
                    .substitute(site_id, Slot::Previous, Slot::Current)
                    .await
                {
                    Ok(()) => warn!("Restored previous release as current for site {}", site_id),
                    Err(restore) => error!(
                        "Failed to restore previous release for site {}: {}",
                        site_id, restore
                    ),
                }
            }
            return Err(DeployError::activation(SwapStep::PromoteStaging, e));
        }

        info!(
            "Activated new release for site {} (previous kept: {})",
            site_id, had_current
        );
        Ok(())
    }

    /// Swap `previous` and `current`
    pub async fn rollback(&self, site_id: SiteId) -> Result<(), DeployError> {
        self.recover_interrupted(site_id).await?;

        if !self.store.exists(site_id, Slot::Previous).await {
            return Err(DeployError::NoPreviousVersion);
        }

        if !self.store.exists(site_id, Slot::Current).await {
            self.store
                .substitute(site_id, Slot::Previous, Slot::Current)
                .await
                .map_err(|e| DeployError::activation(SwapStep::RestorePrevious, e))?;
            info!("Rolled back site {} (no current release was present)", site_id);
            return Ok(());
        }

        self.store
            .substitute(site_id, Slot::Current, Slot::RollbackTmp)
            .await
            .map_err(|e| DeployError::activation(SwapStep::ParkCurrent, e))?;

        if let Err(e) = self
            .store
            .substitute(site_id, Slot::Previous, Slot::Current)
            .await
        {
            error!("Failed to restore previous release for site {}: {}", site_id, e);
            if let Err(restore) = self
                .store
                .substitute(site_id, Slot::RollbackTmp, Slot::Current)
                .await
            {
                error!(
                    "Failed to put current release back for site {}: {}",
                    site_id, restore
                );
            }
            return Err(DeployError::activation(SwapStep::RestorePrevious, e));
        }

        if let Err(e) = self
            .store
            .substitute(site_id, Slot::RollbackTmp, Slot::Previous)
            .await
        {
            // The replaced release stays parked and is recovered by the next rollback.
            warn!(
                "Rolled back site {} but could not keep the replaced release as previous: {}",
                site_id, e
            );
        }

        info!("Rolled back site {}", site_id);
        Ok(())
    }

    /// Return a release parked by an interrupted rollback to the slot it left.
    ///
    /// A parked release is only discarded when `current` and `previous` are both present.
    async fn recover_interrupted(&self, site_id: SiteId) -> Result<(), DeployError> {
        if !self.store.exists(site_id, Slot::RollbackTmp).await {
            return Ok(());
        }

        let target = if !self.store.exists(site_id, Slot::Current).await {
            Slot::Current
        } else if !self.store.exists(site_id, Slot::Previous).await {
            Slot::Previous
        } else {
            warn!("Discarding parked release for site {}", site_id);
            return self
                .store
                .remove(site_id, Slot::RollbackTmp)
                .await
                .map_err(|e| DeployError::activation(SwapStep::RecoverParked, e));
        };

        self.store
            .substitute(site_id, Slot::RollbackTmp, target)
            .await
            .map_err(|e| DeployError::activation(SwapStep::RecoverParked, e))?;
        warn!("Recovered parked release of site {} as {}", site_id, target);
        Ok(())
    }

    pub async fn has_previous(&self, site_id: SiteId) -> bool {
        self.store.exists(site_id, Slot::Previous).await
    }
}
