//! Deployment models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::DeployStatus;

/// Identifier of a hosted site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub i64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SiteId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(SiteId)
    }
}

/// Identifier of the user who uploaded an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One upload attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    /// Unique deploy ID
    pub id: Uuid,

    /// Site the archive was uploaded for
    pub site_id: SiteId,

    /// Uploader
    pub uploader_id: UserId,

    /// Original filename as supplied by the uploader
    pub filename: String,

    /// Lifecycle status
    pub status: DeployStatus,

    /// Full error detail for failed deploys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Hex SHA-256 of the stored upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deploy {
    /// Create a new pending deploy record
    pub fn pending(site_id: SiteId, uploader_id: UserId, filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_id,
            uploader_id,
            filename: filename.into(),
            status: DeployStatus::Pending,
            error_message: None,
            archive_sha256: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the record reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Terminal result applied to a pending deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Success { archive_sha256: Option<String> },
    Failed { error: String, archive_sha256: Option<String> },
}
