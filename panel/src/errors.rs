//! Error types for the micropanel release pipeline

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::guard::PathRejection;
use crate::models::deployment::Deploy;

/// Ambient error type for configuration, storage and ledger plumbing
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Ledger error: {0}")]
    LedgerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid transition: {0}")]
    TransitionError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Rotation step that failed during activation or rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStep {
    DiscardPrevious,
    BackupCurrent,
    PromoteStaging,
    ParkCurrent,
    RestorePrevious,
    RecoverParked,
}

impl fmt::Display for SwapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapStep::DiscardPrevious => "discard previous",
            SwapStep::BackupCurrent => "backup current",
            SwapStep::PromoteStaging => "promote staging",
            SwapStep::ParkCurrent => "park current",
            SwapStep::RestorePrevious => "restore previous",
            SwapStep::RecoverParked => "recover parked release",
        };
        f.write_str(name)
    }
}

/// Release pipeline failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error("archive too large: {size} bytes (max: {limit} bytes)")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("file too large: {path} ({size} bytes, max: {limit} bytes)")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("too many entries in archive: {count} (max: {limit})")]
    TooManyEntries { count: usize, limit: usize },

    #[error("unsupported archive format: {filename}")]
    UnsupportedFormat { filename: String },

    #[error("path traversal detected in entry {entry:?}: {reason}")]
    PathTraversal { entry: String, reason: PathRejection },

    #[error("symlinks not allowed: {entry}")]
    SymlinkRejected { entry: String },

    #[error("extraction failed: {message}")]
    Extraction { message: String },

    #[error("activation failed ({step}): {message}")]
    Activation { step: SwapStep, message: String },

    #[error("no previous version available")]
    NoPreviousVersion,

    #[error("deploy ledger error: {message}")]
    Ledger { message: String },
}

/// Discriminant of [`DeployError`], for exhaustive matching without payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployErrorKind {
    ArchiveTooLarge,
    FileTooLarge,
    TooManyEntries,
    UnsupportedFormat,
    PathTraversal,
    SymlinkRejected,
    Extraction,
    Activation,
    NoPreviousVersion,
    Ledger,
}

impl DeployError {
    /// Get the error kind
    pub fn kind(&self) -> DeployErrorKind {
        match self {
            DeployError::ArchiveTooLarge { .. } => DeployErrorKind::ArchiveTooLarge,
            DeployError::FileTooLarge { .. } => DeployErrorKind::FileTooLarge,
            DeployError::TooManyEntries { .. } => DeployErrorKind::TooManyEntries,
            DeployError::UnsupportedFormat { .. } => DeployErrorKind::UnsupportedFormat,
            DeployError::PathTraversal { .. } => DeployErrorKind::PathTraversal,
            DeployError::SymlinkRejected { .. } => DeployErrorKind::SymlinkRejected,
            DeployError::Extraction { .. } => DeployErrorKind::Extraction,
            DeployError::Activation { .. } => DeployErrorKind::Activation,
            DeployError::NoPreviousVersion => DeployErrorKind::NoPreviousVersion,
            DeployError::Ledger { .. } => DeployErrorKind::Ledger,
        }
    }

    /// Short message for the uploader. Never contains filesystem paths.
    pub fn summary(&self) -> &'static str {
        match self {
            DeployError::ArchiveTooLarge { .. } => "Archive is too large",
            DeployError::FileTooLarge { .. } => "Archive contains a file that is too large",
            DeployError::TooManyEntries { .. } => "Too many files in archive",
            DeployError::UnsupportedFormat { .. } => "Unsupported archive format",
            DeployError::PathTraversal { .. } => "Invalid file paths in archive",
            DeployError::SymlinkRejected { .. } => "Symlinks are not allowed in archive",
            DeployError::Extraction { .. } => "Archive could not be extracted",
            DeployError::Activation { .. } => "Deploy failed",
            DeployError::NoPreviousVersion => "No previous version available",
            DeployError::Ledger { .. } => "Deploy failed",
        }
    }

    pub(crate) fn extraction(err: impl fmt::Display) -> Self {
        DeployError::Extraction {
            message: err.to_string(),
        }
    }

    pub(crate) fn activation(step: SwapStep, err: impl fmt::Display) -> Self {
        DeployError::Activation {
            step,
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for DeployError {
    fn from(err: std::io::Error) -> Self {
        DeployError::extraction(err)
    }
}

impl From<zip::result::ZipError> for DeployError {
    fn from(err: zip::result::ZipError) -> Self {
        DeployError::extraction(err)
    }
}

impl From<PanelError> for DeployError {
    fn from(err: PanelError) -> Self {
        DeployError::Ledger {
            message: err.to_string(),
        }
    }
}

/// A failed deploy together with its finalized ledger record, if one was created
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct DeployFailure {
    pub record: Option<Deploy>,
    #[source]
    pub error: DeployError,
}

impl DeployFailure {
    pub fn new(record: Option<Deploy>, error: DeployError) -> Self {
        Self { record, error }
    }

    pub fn kind(&self) -> DeployErrorKind {
        self.error.kind()
    }
}
