//! TAR+GZIP driver.
//!
//! Tar has no index, so the header pass and the extraction pass each read
//! the whole compressed stream. The source is rewound in between.

use std::io::{Read, Seek};

use ::tar::{Archive, EntryType};
use flate2::read::MultiGzDecoder;

use super::{ArchiveSource, EntryHeader, EntryKind, EntrySource, EntryVisitor};
use crate::errors::DeployError;

pub struct TarGzEntries {
    source: ArchiveSource,
}

impl TarGzEntries {
    pub fn new(source: ArchiveSource) -> Self {
        Self { source }
    }

    fn each<F>(&mut self, max_entries: usize, mut f: F) -> Result<(), DeployError>
    where
        F: FnMut(EntryHeader, &mut dyn Read) -> Result<(), DeployError>,
    {
        self.source.rewind()?;
        let mut archive = Archive::new(MultiGzDecoder::new(&mut self.source));

        let mut count = 0usize;
        for entry in archive.entries()? {
            count += 1;
            if count > max_entries {
                return Err(DeployError::TooManyEntries {
                    count,
                    limit: max_entries,
                });
            }

            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let header = EntryHeader::new(name, kind_of(entry.header().entry_type()), entry.size());
            f(header, &mut entry)?;
        }
        Ok(())
    }
}

fn kind_of(entry_type: EntryType) -> EntryKind {
    match entry_type {
        EntryType::Regular | EntryType::Continuous => EntryKind::File,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink,
        EntryType::Link => EntryKind::HardLink,
        _ => EntryKind::Other,
    }
}

impl EntrySource for TarGzEntries {
    fn scan(&mut self, max_entries: usize) -> Result<Vec<EntryHeader>, DeployError> {
        let mut headers = Vec::new();
        self.each(max_entries, |header, _| {
            headers.push(header);
            Ok(())
        })?;
        Ok(headers)
    }

    fn visit(&mut self, max_entries: usize, visitor: &mut EntryVisitor<'_>) -> Result<(), DeployError> {
        self.each(max_entries, |header, content| visitor(&header, content))
    }
}
