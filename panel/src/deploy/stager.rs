//! Writes archive entries into a site's staging slot

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::deploy::archive::{self, ArchiveFormat, ArchiveItem, ArchiveReader, ArchiveSource};
use crate::deploy::guard::PathGuard;
use crate::errors::DeployError;
use crate::storage::settings::Limits;

#[cfg(unix)]
const FILE_MODE: u32 = 0o644;
#[cfg(unix)]
const DIR_MODE: u32 = 0o755;

/// Summary of a staged release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Entries written (files and directories)
    pub entries: usize,
    pub files: usize,
    pub directories: usize,
    /// Content bytes written
    pub bytes: u64,
    /// Top-level directory removed from every entry
    pub stripped_root: Option<String>,
}

/// Removes the staging directory unless the stage completed
struct StagingGuard {
    path: PathBuf,
    committed: bool,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed staging directory {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove staging directory {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Materializes an archive into a staging directory, all or nothing
#[derive(Debug, Clone)]
pub struct ReleaseStager {
    limits: Limits,
}

impl ReleaseStager {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Extract the stored archive at `archive_path` into `staging`.
    ///
    /// `staging` must not exist. On any failure it is removed again.
    pub async fn stage(
        &self,
        format: ArchiveFormat,
        archive_path: PathBuf,
        staging: PathBuf,
    ) -> Result<StageReport, DeployError> {
        let limits = self.limits;
        tokio::task::spawn_blocking(move || {
            let source = ArchiveSource::open(&archive_path)?;
            stage_blocking(format, source, &staging, limits)
        })
        .await
        .map_err(|e| DeployError::extraction(format!("staging task failed: {}", e)))?
    }
}

/// Blocking extraction of `source` into `staging`
pub fn stage_blocking(
    format: ArchiveFormat,
    source: ArchiveSource,
    staging: &Path,
    limits: Limits,
) -> Result<StageReport, DeployError> {
    create_dir(staging, false)?;
    let guard = StagingGuard::new(staging.to_path_buf());

    let mut entries = archive::open(format, source)?;
    let reader = ArchiveReader::new(PathGuard::new(staging, limits.max_path_length), limits);

    let mut report = StageReport::default();
    let stripped_root = reader.read(entries.as_mut(), |item| {
        match item {
            ArchiveItem::Directory { target, .. } => {
                create_dir(&target, true)?;
                report.directories += 1;
            }
            ArchiveItem::File {
                path,
                target,
                content,
                ..
            } => {
                if let Some(parent) = target.parent() {
                    create_dir(parent, true)?;
                }
                let mut file = create_file(&target)?;
                let written = io::copy(content, &mut file)?;
                file.flush()?;
                debug!("Staged {} ({} bytes)", path.display(), written);
                report.files += 1;
                report.bytes += written;
            }
        }
        report.entries += 1;
        Ok(())
    })?;
    report.stripped_root = stripped_root;

    guard.commit();
    Ok(report)
}

fn create_dir(path: &Path, recursive: bool) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(recursive);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(path)
}

fn create_file(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    options.open(path)
}
