//! Storage layout of the sites base directory

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::PanelError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::SiteId;
use crate::utils::sanitize_filename;

/// Named release slots inside a site directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Live, served content
    Current,
    /// Content that was live before the latest activation
    Previous,
    /// Extraction target of an in-flight deploy
    Staging,
    /// Parking slot used while rotating during rollback
    RollbackTmp,
}

impl Slot {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Slot::Current => "current",
            Slot::Previous => "previous",
            Slot::Staging => "staging",
            Slot::RollbackTmp => "rollback-tmp",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Layout of the sites base directory
#[derive(Debug, Clone)]
pub struct SitesLayout {
    /// Base directory holding one directory per site
    pub base_dir: PathBuf,
}

impl SitesLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the layout of one site
    pub fn site(&self, site_id: SiteId) -> SiteLayout {
        SiteLayout {
            site_id,
            root: Dir::new(self.base_dir.join(site_id.to_string())),
        }
    }
}

/// Release area of a single site: `{base}/{site_id}/...`
#[derive(Debug, Clone)]
pub struct SiteLayout {
    site_id: SiteId,
    root: Dir,
}

impl SiteLayout {
    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Get the site directory
    pub fn site_dir(&self) -> &Dir {
        &self.root
    }

    /// Get a release slot directory
    pub fn slot(&self, slot: Slot) -> Dir {
        self.root.subdir(slot.dir_name())
    }

    /// Get the retention directory for uploaded archives
    pub fn archive_store(&self) -> Dir {
        self.root.subdir("archive-store")
    }

    /// Get the archive-store file for an upload
    pub fn archive_file(&self, uploaded_at: DateTime<Utc>, deploy_id: Uuid, original: &str) -> File {
        self.archive_store()
            .file(&archive_file_name(uploaded_at, deploy_id, original))
    }

    /// Create the site and archive-store directories
    pub async fn setup(&self) -> Result<(), PanelError> {
        self.root.create().await?;
        self.archive_store().create().await?;
        Ok(())
    }
}

/// Collision-free archive-store name: `{unix_ts}_{short_id}_{sanitized original}`
pub fn archive_file_name(uploaded_at: DateTime<Utc>, deploy_id: Uuid, original: &str) -> String {
    let id = deploy_id.simple().to_string();
    format!(
        "{}_{}_{}",
        uploaded_at.timestamp(),
        &id[..8],
        sanitize_filename(original)
    )
}
