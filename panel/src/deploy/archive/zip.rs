//! ZIP driver. Entry metadata comes from the central directory.

use ::zip::ZipArchive;

use super::{ArchiveSource, EntryHeader, EntryKind, EntrySource, EntryVisitor};
use crate::errors::DeployError;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

pub struct ZipEntries {
    archive: ZipArchive<ArchiveSource>,
}

impl ZipEntries {
    pub fn new(source: ArchiveSource) -> Result<Self, DeployError> {
        Ok(Self {
            archive: ZipArchive::new(source)?,
        })
    }

    fn check_count(&self, max_entries: usize) -> Result<(), DeployError> {
        let count = self.archive.len();
        if count > max_entries {
            return Err(DeployError::TooManyEntries {
                count,
                limit: max_entries,
            });
        }
        Ok(())
    }
}

fn header_at(archive: &mut ZipArchive<ArchiveSource>, index: usize) -> Result<EntryHeader, DeployError> {
    let file = archive.by_index_raw(index)?;
    let is_symlink = file
        .unix_mode()
        .is_some_and(|mode| mode & S_IFMT == S_IFLNK);

    let kind = if is_symlink {
        EntryKind::Symlink
    } else if file.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };

    Ok(EntryHeader::new(file.name(), kind, file.size()))
}

impl EntrySource for ZipEntries {
    fn scan(&mut self, max_entries: usize) -> Result<Vec<EntryHeader>, DeployError> {
        self.check_count(max_entries)?;

        let mut headers = Vec::with_capacity(self.archive.len());
        for index in 0..self.archive.len() {
            headers.push(header_at(&mut self.archive, index)?);
        }
        Ok(headers)
    }

    fn visit(&mut self, max_entries: usize, visitor: &mut EntryVisitor<'_>) -> Result<(), DeployError> {
        self.check_count(max_entries)?;

        for index in 0..self.archive.len() {
            let header = header_at(&mut self.archive, index)?;
            if header.kind == EntryKind::Symlink {
                // Link targets are never decompressed.
                visitor(&header, &mut std::io::empty())?;
                continue;
            }
            let mut file = self.archive.by_index(index)?;
            visitor(&header, &mut file)?;
        }
        Ok(())
    }
}
