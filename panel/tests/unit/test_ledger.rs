//! Deploy ledger tests

use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use micropanel::deploy::executor::{DeployExecutor, DeployRequest};
use micropanel::deploy::fsm::DeployStatus;
use micropanel::deploy::ledger::{DeployLedger, JsonLedger, MemoryLedger};
use micropanel::deploy::swapper::FsSlotStore;
use micropanel::errors::{DeployErrorKind, PanelError};
use micropanel::models::deployment::{Deploy, DeployOutcome, SiteId, UserId};
use micropanel::storage::layout::{SitesLayout, Slot};
use micropanel::storage::settings::Limits;

const SITE: SiteId = SiteId(11);

fn site_zip(body: &str) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("index.html", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(body.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

fn request(filename: &str, bytes: Vec<u8>) -> DeployRequest<Cursor<Vec<u8>>> {
    DeployRequest {
        site_id: SITE,
        uploader_id: UserId(4),
        filename: filename.to_string(),
        declared_size: bytes.len() as u64,
        content: Cursor::new(bytes),
    }
}

fn executor(layout: &SitesLayout, ledger: Arc<dyn DeployLedger>) -> DeployExecutor {
    DeployExecutor::new(
        Limits::default(),
        layout.clone(),
        ledger,
        Arc::new(FsSlotStore::new(layout.clone())),
    )
}

/// Records whether the site directory existed when each pending record was written
struct ObservingLedger {
    inner: MemoryLedger,
    site_dir: PathBuf,
    site_existed_at_create: Mutex<Vec<bool>>,
}

#[async_trait]
impl DeployLedger for ObservingLedger {
    async fn create(&self, deploy: &Deploy) -> Result<(), PanelError> {
        self.site_existed_at_create
            .lock()
            .unwrap()
            .push(self.site_dir.exists());
        self.inner.create(deploy).await
    }

    async fn finalize(&self, id: Uuid, outcome: DeployOutcome) -> Result<Deploy, PanelError> {
        self.inner.finalize(id, outcome).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Deploy>, PanelError> {
        self.inner.get(id).await
    }

    async fn list_by_site(&self, site_id: SiteId, limit: usize) -> Result<Vec<Deploy>, PanelError> {
        self.inner.list_by_site(site_id, limit).await
    }

    async fn last_successful(&self, site_id: SiteId) -> Result<Option<Deploy>, PanelError> {
        self.inner.last_successful(site_id).await
    }

    async fn list_pending(&self) -> Result<Vec<Deploy>, PanelError> {
        self.inner.list_pending().await
    }
}

/// Ledger whose writes always fail
struct UnavailableLedger;

#[async_trait]
impl DeployLedger for UnavailableLedger {
    async fn create(&self, _: &Deploy) -> Result<(), PanelError> {
        Err(PanelError::LedgerError("database is locked".to_string()))
    }

    async fn finalize(&self, _: Uuid, _: DeployOutcome) -> Result<Deploy, PanelError> {
        Err(PanelError::LedgerError("database is locked".to_string()))
    }

    async fn get(&self, _: Uuid) -> Result<Option<Deploy>, PanelError> {
        Ok(None)
    }

    async fn list_by_site(&self, _: SiteId, _: usize) -> Result<Vec<Deploy>, PanelError> {
        Ok(Vec::new())
    }

    async fn last_successful(&self, _: SiteId) -> Result<Option<Deploy>, PanelError> {
        Ok(None)
    }

    async fn list_pending(&self) -> Result<Vec<Deploy>, PanelError> {
        Ok(Vec::new())
    }
}

/// Pauses every `create` after the record is stored until released
struct GatedLedger {
    inner: MemoryLedger,
    created: Notify,
    release: Notify,
}

#[async_trait]
impl DeployLedger for GatedLedger {
    async fn create(&self, deploy: &Deploy) -> Result<(), PanelError> {
        self.inner.create(deploy).await?;
        self.created.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn finalize(&self, id: Uuid, outcome: DeployOutcome) -> Result<Deploy, PanelError> {
        self.inner.finalize(id, outcome).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Deploy>, PanelError> {
        self.inner.get(id).await
    }

    async fn list_by_site(&self, site_id: SiteId, limit: usize) -> Result<Vec<Deploy>, PanelError> {
        self.inner.list_by_site(site_id, limit).await
    }

    async fn last_successful(&self, site_id: SiteId) -> Result<Option<Deploy>, PanelError> {
        self.inner.last_successful(site_id).await
    }

    async fn list_pending(&self) -> Result<Vec<Deploy>, PanelError> {
        self.inner.list_pending().await
    }
}

#[tokio::test]
async fn test_json_ledger_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = SitesLayout::new(tmp.path().join("sites"));
    let ledger_dir = tmp.path().join("ledger");

    let deploy = executor(&layout, Arc::new(JsonLedger::new(&ledger_dir)))
        .deploy(request("site.zip", site_zip("v1")))
        .await
        .unwrap();

    let reopened = JsonLedger::new(&ledger_dir);
    let stored = reopened.get(deploy.id).await.unwrap().unwrap();
    assert_eq!(stored, deploy);
    assert_eq!(stored.status, DeployStatus::Success);
    assert!(ledger_dir.join(format!("{}.json", deploy.id)).exists());
    assert_eq!(reopened.last_successful(SITE).await.unwrap().unwrap().id, deploy.id);
}

#[tokio::test]
async fn test_json_ledger_transitions() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = JsonLedger::new(tmp.path());
    let deploy = Deploy::pending(SITE, UserId(1), "site.zip");

    ledger.create(&deploy).await.unwrap();
    assert!(matches!(
        ledger.create(&deploy).await,
        Err(PanelError::LedgerError(_))
    ));
    assert_eq!(ledger.list_pending().await.unwrap().len(), 1);

    let failed = ledger
        .finalize(
            deploy.id,
            DeployOutcome::Failed {
                error: "too many entries in archive: 10001 (max: 10000)".to_string(),
                archive_sha256: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.status, DeployStatus::Failed);
    assert!(ledger.list_pending().await.unwrap().is_empty());

    let again = ledger
        .finalize(deploy.id, DeployOutcome::Success { archive_sha256: None })
        .await;
    assert!(matches!(again, Err(PanelError::TransitionError(_))));
    assert_eq!(
        ledger.get(deploy.id).await.unwrap().unwrap().status,
        DeployStatus::Failed
    );

    assert!(matches!(
        ledger
            .finalize(Uuid::new_v4(), DeployOutcome::Success { archive_sha256: None })
            .await,
        Err(PanelError::NotFound(_))
    ));
}

#[test]
fn test_json_ledger_empty_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = JsonLedger::new(tmp.path().join("missing"));

    let listed = tokio_test::block_on(ledger.list_by_site(SITE, 10));
    assert!(tokio_test::assert_ok!(listed).is_empty());
    let found = tokio_test::block_on(ledger.get(Uuid::new_v4()));
    assert!(tokio_test::assert_ok!(found).is_none());
}

#[tokio::test]
async fn test_pending_recorded_before_site_is_touched() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = SitesLayout::new(tmp.path().join("sites"));
    let ledger = Arc::new(ObservingLedger {
        inner: MemoryLedger::new(),
        site_dir: layout.site(SITE).site_dir().path().to_path_buf(),
        site_existed_at_create: Mutex::new(Vec::new()),
    });

    executor(&layout, ledger.clone())
        .deploy(request("site.zip", site_zip("v1")))
        .await
        .unwrap();

    assert_eq!(*ledger.site_existed_at_create.lock().unwrap(), vec![false]);
}

#[tokio::test]
async fn test_failed_deploy_keeps_detail_in_ledger() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = SitesLayout::new(tmp.path().join("sites"));
    let ledger = Arc::new(MemoryLedger::new());
    let executor = executor(&layout, ledger.clone());

    let failure = executor
        .deploy(request("site.7z", b"7z".to_vec()))
        .await
        .unwrap_err();

    let record = failure.record.unwrap();
    let stored = ledger.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeployStatus::Failed);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("unsupported archive format: site.7z")
    );
    assert!(stored.archive_sha256.is_none());
}

#[tokio::test]
async fn test_unavailable_ledger_blocks_deploy() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = SitesLayout::new(tmp.path().join("sites"));

    let failure = executor(&layout, Arc::new(UnavailableLedger))
        .deploy(request("site.zip", site_zip("v1")))
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), DeployErrorKind::Ledger);
    assert!(failure.record.is_none());
    assert!(!layout.site(SITE).site_dir().path().exists());
}

#[tokio::test]
async fn test_history_is_newest_first() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = SitesLayout::new(tmp.path().join("sites"));
    let executor = executor(&layout, Arc::new(JsonLedger::new(tmp.path().join("ledger"))));

    let mut ids = Vec::new();
    for version in ["v1", "v2", "v3"] {
        let deploy = executor
            .deploy(request("site.zip", site_zip(version)))
            .await
            .unwrap();
        ids.push(deploy.id);
    }

    let history = executor.list_deploys(SITE, 2).await.unwrap();
    let listed: Vec<Uuid> = history.iter().map(|d| d.id).collect();
    assert_eq!(listed, vec![ids[2], ids[1]]);
    assert!(executor.list_deploys(SiteId(999), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconcile_fails_interrupted_deploys() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = SitesLayout::new(tmp.path().join("sites"));
    let ledger_dir = tmp.path().join("ledger");
    let ledger = Arc::new(JsonLedger::new(&ledger_dir));
    let executor = executor(&layout, ledger.clone());

    let done = executor
        .deploy(request("site.zip", site_zip("v1")))
        .await
        .unwrap();

    // A crash mid-extraction leaves a pending record and a staging slot.
    let interrupted = Deploy::pending(SITE, UserId(4), "site.zip");
    ledger.create(&interrupted).await.unwrap();
    let staging = layout.site(SITE).slot(Slot::Staging);
    std::fs::create_dir_all(staging.path().join("css")).unwrap();

    assert_eq!(executor.reconcile_pending().await.unwrap(), 1);

    let record = ledger.get(interrupted.id).await.unwrap().unwrap();
    assert_eq!(record.status, DeployStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("interrupted before completion"));
    assert!(!staging.path().exists());
    assert_eq!(
        ledger.get(done.id).await.unwrap().unwrap().status,
        DeployStatus::Success
    );
    assert!(layout.site(SITE).slot(Slot::Current).path().join("index.html").exists());

    assert_eq!(executor.reconcile_pending().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconcile_leaves_in_flight_deploy_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = SitesLayout::new(tmp.path().join("sites"));
    let ledger = Arc::new(GatedLedger {
        inner: MemoryLedger::new(),
        created: Notify::new(),
        release: Notify::new(),
    });
    let executor = Arc::new(executor(&layout, ledger.clone()));

    let deploying = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.deploy(request("site.zip", site_zip("v1"))).await })
    };
    ledger.created.notified().await;
    assert_eq!(ledger.list_pending().await.unwrap().len(), 1);

    let reconciling = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.reconcile_pending().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    ledger.release.notify_one();

    let deploy = deploying.await.unwrap().unwrap();
    assert_eq!(reconciling.await.unwrap().unwrap(), 0);

    let record = ledger.get(deploy.id).await.unwrap().unwrap();
    assert_eq!(record.status, DeployStatus::Success);
    assert_eq!(record.error_message, None);
    assert!(ledger.list_pending().await.unwrap().is_empty());
    assert!(layout.site(SITE).slot(Slot::Current).path().join("index.html").exists());
}
