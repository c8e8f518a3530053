//! Release pipeline entry points

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::deploy::archive::ArchiveFormat;
use crate::deploy::ledger::{apply_outcome, DeployLedger, JsonLedger};
use crate::deploy::locks::SiteLocks;
use crate::deploy::stager::ReleaseStager;
use crate::deploy::swapper::{FsSlotStore, ReleaseSwapper, SlotStore};
use crate::errors::{DeployError, DeployFailure, PanelError};
use crate::models::deployment::{Deploy, DeployOutcome, SiteId, UserId};
use crate::storage::layout::{SitesLayout, Slot};
use crate::storage::settings::{Limits, Settings};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

const INTERRUPTED: &str = "interrupted before completion";

/// One upload to be released
pub struct DeployRequest<R> {
    pub site_id: SiteId,
    pub uploader_id: UserId,
    /// Original filename; its extension selects the archive format
    pub filename: String,
    pub content: R,
    /// Size announced by the uploader, checked before reading
    pub declared_size: u64,
}

/// Runs deploys and rollbacks, one at a time per site
pub struct DeployExecutor {
    limits: Limits,
    layout: SitesLayout,
    ledger: Arc<dyn DeployLedger>,
    stager: ReleaseStager,
    swapper: ReleaseSwapper,
    locks: SiteLocks,
}

impl DeployExecutor {
    pub fn new(
        limits: Limits,
        layout: SitesLayout,
        ledger: Arc<dyn DeployLedger>,
        slots: Arc<dyn SlotStore>,
    ) -> Self {
        Self {
            limits,
            layout,
            ledger,
            stager: ReleaseStager::new(limits),
            swapper: ReleaseSwapper::new(slots),
            locks: SiteLocks::new(),
        }
    }

    /// Executor over the local filesystem with a JSON ledger
    pub fn from_settings(settings: &Settings) -> Self {
        let layout = SitesLayout::new(&settings.sites.path);
        Self::new(
            settings.limits(),
            layout.clone(),
            Arc::new(JsonLedger::new(&settings.ledger.path)),
            Arc::new(FsSlotStore::new(layout)),
        )
    }

    pub fn layout(&self) -> &SitesLayout {
        &self.layout
    }

    pub fn ledger(&self) -> &Arc<dyn DeployLedger> {
        &self.ledger
    }

    /// Validate, stage and activate an uploaded archive.
    ///
    /// The site lease is taken first, then the pending record is written
    /// before anything touches the site. On failure the finalized record
    /// travels with the error.
    pub async fn deploy<R>(&self, request: DeployRequest<R>) -> Result<Deploy, DeployFailure>
    where
        R: AsyncRead + Unpin + Send,
    {
        info!(
            "Deploying {} to site {} (uploader {})",
            request.filename, request.site_id, request.uploader_id
        );

        // Taken before the pending record; reconcile re-checks records under it.
        let _lease = self.locks.acquire(request.site_id).await;

        let record = Deploy::pending(request.site_id, request.uploader_id, &request.filename);
        if let Err(e) = self.ledger.create(&record).await {
            error!("Failed to record pending deploy for site {}: {}", request.site_id, e);
            return Err(DeployFailure::new(None, e.into()));
        }

        let mut archive_sha256 = None;
        let result = self.run(&record, request, &mut archive_sha256).await;

        let outcome = match &result {
            Ok(()) => DeployOutcome::Success {
                archive_sha256: archive_sha256.clone(),
            },
            Err(e) => DeployOutcome::Failed {
                error: e.to_string(),
                archive_sha256: archive_sha256.clone(),
            },
        };

        let finalized = match self.ledger.finalize(record.id, outcome.clone()).await {
            Ok(deploy) => deploy,
            Err(e) => {
                error!("Failed to finalize deploy {}: {}", record.id, e);
                let mut deploy = record.clone();
                if let Err(e) = apply_outcome(&mut deploy, outcome) {
                    warn!("Deploy {} could not be finalized locally: {}", record.id, e);
                }
                deploy
            }
        };

        match result {
            Ok(()) => {
                info!("Deploy {} succeeded for site {}", finalized.id, finalized.site_id);
                Ok(finalized)
            }
            Err(error) => {
                warn!(
                    "Deploy {} failed for site {}: {}",
                    finalized.id, finalized.site_id, error
                );
                Err(DeployFailure::new(Some(finalized), error))
            }
        }
    }

    async fn run<R>(
        &self,
        record: &Deploy,
        request: DeployRequest<R>,
        archive_sha256: &mut Option<String>,
    ) -> Result<(), DeployError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if request.declared_size > self.limits.max_archive_size {
            return Err(DeployError::ArchiveTooLarge {
                size: request.declared_size,
                limit: self.limits.max_archive_size,
            });
        }

        let format = ArchiveFormat::from_filename(&request.filename).ok_or_else(|| {
            DeployError::UnsupportedFormat {
                filename: request.filename.clone(),
            }
        })?;
        debug!("Archive format for deploy {}: {}", record.id, format.as_str());

        let site = self.layout.site(record.site_id);
        site.setup().await.map_err(DeployError::extraction)?;

        let archive = site.archive_file(record.created_at, record.id, &request.filename);
        let (size, digest) =
            persist_upload(request.content, archive.path(), self.limits.max_archive_size).await?;
        info!(
            "Stored upload for deploy {} at {} ({} bytes)",
            record.id,
            archive.path().display(),
            size
        );
        *archive_sha256 = Some(digest);

        let staging = site.slot(Slot::Staging);
        if staging.exists().await {
            warn!("Purging stale staging directory for site {}", record.site_id);
        }
        staging.delete().await.map_err(DeployError::extraction)?;

        let report = self
            .stager
            .stage(format, archive.path().to_path_buf(), staging.path().to_path_buf())
            .await?;
        info!(
            "Staged deploy {}: {} files, {} directories, {} bytes",
            record.id, report.files, report.directories, report.bytes
        );

        if let Err(e) = self.swapper.activate(record.site_id).await {
            if let Err(cleanup) = staging.delete().await {
                warn!("Failed to remove staging for site {}: {}", record.site_id, cleanup);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Restore the previous release of a site
    pub async fn rollback(&self, site_id: SiteId) -> Result<(), DeployError> {
        info!("Rolling back site {}", site_id);
        let _lease = self.locks.acquire(site_id).await;
        self.swapper.rollback(site_id).await
    }

    pub async fn has_previous_version(&self, site_id: SiteId) -> bool {
        self.swapper.has_previous(site_id).await
    }

    /// Newest deploys of a site
    pub async fn list_deploys(&self, site_id: SiteId, limit: usize) -> Result<Vec<Deploy>, PanelError> {
        self.ledger.list_by_site(site_id, limit).await
    }

    /// Fail deploys left pending by a crashed process and purge their staging slots.
    ///
    /// Each record is re-checked under its site's lease, so deploys running
    /// alongside are left alone.
    pub async fn reconcile_pending(&self) -> Result<usize, PanelError> {
        let pending = self.ledger.list_pending().await?;
        let mut reconciled = 0;

        for deploy in pending {
            let _lease = self.locks.acquire(deploy.site_id).await;

            // Finished while we waited for the lease.
            match self.ledger.get(deploy.id).await? {
                Some(current) if !current.is_finished() => {}
                _ => continue,
            }

            self.ledger
                .finalize(
                    deploy.id,
                    DeployOutcome::Failed {
                        error: INTERRUPTED.to_string(),
                        archive_sha256: None,
                    },
                )
                .await?;
            self.layout
                .site(deploy.site_id)
                .slot(Slot::Staging)
                .delete()
                .await?;

            warn!("Marked interrupted deploy {} for site {} as failed", deploy.id, deploy.site_id);
            reconciled += 1;
        }

        if reconciled > 0 {
            info!("Reconciled {} interrupted deploys", reconciled);
        }
        Ok(reconciled)
    }
}

/// Stream an upload into the archive store, hashing it on the way.
///
/// Reads at most `limit + 1` bytes. The partial file is removed on failure.
async fn persist_upload<R>(content: R, path: &Path, limit: u64) -> Result<(u64, String), DeployError>
where
    R: AsyncRead + Unpin,
{
    let mut file = fs::File::create(path).await?;
    let result = copy_hashed(content.take(limit.saturating_add(1)), &mut file).await;

    let failure = match result {
        Ok((size, _)) if size > limit => DeployError::ArchiveTooLarge { size, limit },
        Ok((size, digest)) => match file.sync_all().await {
            Ok(()) => return Ok((size, digest)),
            Err(e) => e.into(),
        },
        Err(e) => e.into(),
    };

    drop(file);
    if let Err(e) = fs::remove_file(path).await {
        warn!("Failed to remove partial upload {}: {}", path.display(), e);
    }
    Err(failure)
}

async fn copy_hashed<R, W>(mut reader: R, writer: &mut W) -> std::io::Result<(u64, String)>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;

    Ok((total, hex::encode(hasher.finalize())))
}
