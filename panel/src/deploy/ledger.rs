//! Deploy lifecycle records

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::deploy::fsm::{DeployEvent, DeployFsm, DeployStatus};
use crate::errors::PanelError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::{Deploy, DeployOutcome, SiteId};

/// Storage of deploy records.
///
/// A record is created `pending` and finalized exactly once.
#[async_trait]
pub trait DeployLedger: Send + Sync {
    /// Durably store a new pending record
    async fn create(&self, deploy: &Deploy) -> Result<(), PanelError>;

    /// Move a pending record to its terminal status
    async fn finalize(&self, id: Uuid, outcome: DeployOutcome) -> Result<Deploy, PanelError>;

    async fn get(&self, id: Uuid) -> Result<Option<Deploy>, PanelError>;

    /// Newest first
    async fn list_by_site(&self, site_id: SiteId, limit: usize) -> Result<Vec<Deploy>, PanelError>;

    async fn last_successful(&self, site_id: SiteId) -> Result<Option<Deploy>, PanelError>;

    async fn list_pending(&self) -> Result<Vec<Deploy>, PanelError>;
}

/// Apply `outcome` to a pending record, enforcing the status transition
pub fn apply_outcome(deploy: &mut Deploy, outcome: DeployOutcome) -> Result<(), PanelError> {
    let mut fsm = DeployFsm::resume(deploy.status, deploy.error_message.clone());
    let archive_sha256 = match outcome {
        DeployOutcome::Success { archive_sha256 } => {
            fsm.process(DeployEvent::Succeed)?;
            archive_sha256
        }
        DeployOutcome::Failed {
            error,
            archive_sha256,
        } => {
            fsm.process(DeployEvent::Fail(error))?;
            archive_sha256
        }
    };

    deploy.status = fsm.status();
    deploy.error_message = fsm.error().map(str::to_string);
    if archive_sha256.is_some() {
        deploy.archive_sha256 = archive_sha256;
    }
    deploy.finished_at = Some(Utc::now());
    Ok(())
}

fn newest_first(deploys: &mut [Deploy]) {
    deploys.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

/// In-process ledger
#[derive(Debug, Default)]
pub struct MemoryLedger {
    deploys: RwLock<HashMap<Uuid, Deploy>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn select<F>(&self, filter: F) -> Vec<Deploy>
    where
        F: Fn(&Deploy) -> bool,
    {
        let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<Deploy> = deploys.values().filter(|d| filter(d)).cloned().collect();
        newest_first(&mut selected);
        selected
    }
}

#[async_trait]
impl DeployLedger for MemoryLedger {
    async fn create(&self, deploy: &Deploy) -> Result<(), PanelError> {
        let mut deploys = self.deploys.write().unwrap_or_else(|e| e.into_inner());
        if deploys.contains_key(&deploy.id) {
            return Err(PanelError::LedgerError(format!("deploy {} already exists", deploy.id)));
        }
        deploys.insert(deploy.id, deploy.clone());
        Ok(())
    }

    async fn finalize(&self, id: Uuid, outcome: DeployOutcome) -> Result<Deploy, PanelError> {
        let mut deploys = self.deploys.write().unwrap_or_else(|e| e.into_inner());
        let deploy = deploys
            .get_mut(&id)
            .ok_or_else(|| PanelError::NotFound(format!("deploy {}", id)))?;
        apply_outcome(deploy, outcome)?;
        Ok(deploy.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Deploy>, PanelError> {
        let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
        Ok(deploys.get(&id).cloned())
    }

    async fn list_by_site(&self, site_id: SiteId, limit: usize) -> Result<Vec<Deploy>, PanelError> {
        let mut deploys = self.select(|d| d.site_id == site_id);
        deploys.truncate(limit);
        Ok(deploys)
    }

    async fn last_successful(&self, site_id: SiteId) -> Result<Option<Deploy>, PanelError> {
        Ok(self
            .select(|d| d.site_id == site_id && d.status == DeployStatus::Success)
            .into_iter()
            .next())
    }

    async fn list_pending(&self) -> Result<Vec<Deploy>, PanelError> {
        Ok(self.select(|d| d.status == DeployStatus::Pending))
    }
}

/// Ledger persisting one JSON document per deploy: `{dir}/{id}.json`
#[derive(Debug, Clone)]
pub struct JsonLedger {
    dir: Dir,
}

impl JsonLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Dir::new(dir) }
    }

    fn record_file(&self, id: Uuid) -> File {
        self.dir.file(&format!("{}.json", id))
    }

    async fn load_all(&self) -> Result<Vec<Deploy>, PanelError> {
        if !self.dir.exists().await {
            return Ok(Vec::new());
        }

        let mut deploys = Vec::new();
        for path in self.dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::new(&path).read_json::<Deploy>().await {
                Ok(deploy) => deploys.push(deploy),
                Err(e) => warn!("Skipping unreadable deploy record {}: {}", path.display(), e),
            }
        }
        newest_first(&mut deploys);
        Ok(deploys)
    }
}

#[async_trait]
impl DeployLedger for JsonLedger {
    async fn create(&self, deploy: &Deploy) -> Result<(), PanelError> {
        let file = self.record_file(deploy.id);
        if file.exists().await {
            return Err(PanelError::LedgerError(format!("deploy {} already exists", deploy.id)));
        }
        file.write_json(deploy).await?;
        debug!("Recorded pending deploy {}", deploy.id);
        Ok(())
    }

    async fn finalize(&self, id: Uuid, outcome: DeployOutcome) -> Result<Deploy, PanelError> {
        let mut deploy = self
            .get(id)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("deploy {}", id)))?;
        apply_outcome(&mut deploy, outcome)?;
        self.record_file(id).write_json(&deploy).await?;
        debug!("Finalized deploy {} as {}", id, deploy.status.as_str());
        Ok(deploy)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Deploy>, PanelError> {
        let file = self.record_file(id);
        if !file.exists().await {
            return Ok(None);
        }
        Ok(Some(file.read_json().await?))
    }

    async fn list_by_site(&self, site_id: SiteId, limit: usize) -> Result<Vec<Deploy>, PanelError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|d| d.site_id == site_id)
            .take(limit)
            .collect())
    }

    async fn last_successful(&self, site_id: SiteId) -> Result<Option<Deploy>, PanelError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|d| d.site_id == site_id && d.status == DeployStatus::Success))
    }

    async fn list_pending(&self) -> Result<Vec<Deploy>, PanelError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|d| d.status == DeployStatus::Pending)
            .collect())
    }
}
