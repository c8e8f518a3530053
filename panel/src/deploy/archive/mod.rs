//! Archive drivers and the entry rules shared by every format

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::deploy::guard::PathGuard;
use crate::errors::DeployError;
use crate::storage::settings::Limits;

pub mod tar;
pub mod zip;

pub use self::tar::TarGzEntries;
pub use self::zip::ZipEntries;

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from an upload's filename (case-insensitive)
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A rewindable archive byte source.
///
/// Non-seekable input has to be spooled to a temporary file first; the
/// choice is made by picking the constructor.
pub struct ArchiveSource {
    inner: Box<dyn ReadSeek>,
}

impl ArchiveSource {
    /// Wrap a reader that already supports seeking
    pub fn seekable<R>(reader: R) -> Self
    where
        R: Read + Seek + Send + 'static,
    {
        Self {
            inner: Box::new(reader),
        }
    }

    /// Open a stored archive file
    pub fn open(path: &Path) -> Result<Self, DeployError> {
        Ok(Self::seekable(fs::File::open(path)?))
    }

    /// Copy a non-seekable reader into an anonymous temporary file.
    ///
    /// At most `limit + 1` bytes are read; longer input is rejected.
    pub fn spool<R: Read>(reader: R, limit: u64) -> Result<Self, DeployError> {
        let mut spool = tempfile::tempfile()?;
        let copied = io::copy(&mut reader.take(limit.saturating_add(1)), &mut spool)?;
        if copied > limit {
            return Err(DeployError::ArchiveTooLarge {
                size: copied,
                limit,
            });
        }
        spool.seek(SeekFrom::Start(0))?;
        Ok(Self::seekable(spool))
    }
}

impl Read for ArchiveSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for ArchiveSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Entry type as declared by the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    HardLink,
    /// Extension headers, device nodes and other records that carry no content
    Other,
}

/// Metadata of one archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// Raw entry name, untrusted
    pub name: String,
    pub kind: EntryKind,
    /// Declared uncompressed size
    pub size: u64,
}

impl EntryHeader {
    pub fn new(name: impl Into<String>, kind: EntryKind, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
        }
    }
}

/// Callback receiving each entry and its content stream
pub type EntryVisitor<'v> = dyn FnMut(&EntryHeader, &mut dyn Read) -> Result<(), DeployError> + 'v;

/// Format driver over a rewindable source
pub trait EntrySource {
    /// Metadata-only pass over all entries
    fn scan(&mut self, max_entries: usize) -> Result<Vec<EntryHeader>, DeployError>;

    /// Single streaming pass handing every entry's content to `visitor`
    fn visit(&mut self, max_entries: usize, visitor: &mut EntryVisitor<'_>) -> Result<(), DeployError>;
}

/// Open the format driver for `source`
pub fn open(format: ArchiveFormat, source: ArchiveSource) -> Result<Box<dyn EntrySource>, DeployError> {
    match format {
        ArchiveFormat::Zip => Ok(Box::new(ZipEntries::new(source)?)),
        ArchiveFormat::TarGz => Ok(Box::new(TarGzEntries::new(source))),
    }
}

/// Detect a single top-level directory shared by every entry.
///
/// Returns `None` when any entry sits at the top level as a file or when
/// entries disagree. Metadata records do not take part.
pub fn common_root(headers: &[EntryHeader]) -> Option<String> {
    let mut root: Option<&str> = None;

    for header in headers.iter().filter(|h| h.kind != EntryKind::Other) {
        let name = header.name.trim_end_matches('/');
        let candidate = match name.find('/') {
            Some(idx) if idx > 0 => &name[..idx],
            Some(_) => return None,
            None if header.kind == EntryKind::Directory && !name.is_empty() => name,
            None => return None,
        };

        match root {
            None => root = Some(candidate),
            Some(existing) if existing == candidate => {}
            Some(_) => return None,
        }
    }

    root.map(str::to_string)
}

/// Remove `root` from an entry name. `None` means the entry is the root itself.
fn strip_root<'a>(name: &'a str, root: Option<&str>) -> Option<&'a str> {
    let Some(root) = root else {
        return Some(name);
    };
    let trimmed = name.trim_end_matches('/');
    if trimmed == root {
        return None;
    }
    Some(
        name.strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(name),
    )
}

/// A validated entry ready to be written
pub enum ArchiveItem<'a> {
    Directory {
        /// Path relative to the extraction root
        path: PathBuf,
        /// Absolute target below the extraction root
        target: PathBuf,
    },
    File {
        path: PathBuf,
        target: PathBuf,
        /// Declared size
        size: u64,
        /// Content capped at the per-file and aggregate limits
        content: &'a mut dyn Read,
    },
}

/// Applies path, link and size rules to the entries of any driver
pub struct ArchiveReader {
    guard: PathGuard,
    limits: Limits,
}

impl ArchiveReader {
    pub fn new(guard: PathGuard, limits: Limits) -> Self {
        Self { guard, limits }
    }

    /// Walk every entry of `entries`, passing validated items to `sink`.
    ///
    /// Returns the stripped common root, if any.
    pub fn read<F>(&self, entries: &mut dyn EntrySource, mut sink: F) -> Result<Option<String>, DeployError>
    where
        F: FnMut(ArchiveItem<'_>) -> Result<(), DeployError>,
    {
        let headers = entries.scan(self.limits.max_entries)?;
        let root = common_root(&headers);
        debug!("Scanned {} entries", headers.len());
        if let Some(root) = &root {
            info!("Stripping common root directory {:?}", root);
        }
        drop(headers);

        let mut extracted: u64 = 0;
        entries.visit(
            self.limits.max_entries,
            &mut |header: &EntryHeader, content: &mut dyn Read| {
                self.visit_entry(header, content, root.as_deref(), &mut extracted, &mut sink)
            },
        )?;

        Ok(root)
    }

    fn visit_entry<F>(
        &self,
        header: &EntryHeader,
        content: &mut dyn Read,
        root: Option<&str>,
        extracted: &mut u64,
        sink: &mut F,
    ) -> Result<(), DeployError>
    where
        F: FnMut(ArchiveItem<'_>) -> Result<(), DeployError>,
    {
        if header.kind == EntryKind::Other {
            debug!("Skipping metadata entry {:?}", header.name);
            return Ok(());
        }

        self.guard
            .validate(&header.name)
            .map_err(|reason| DeployError::PathTraversal {
                entry: header.name.clone(),
                reason,
            })?;

        if matches!(header.kind, EntryKind::Symlink | EntryKind::HardLink) {
            return Err(DeployError::SymlinkRejected {
                entry: header.name.clone(),
            });
        }

        let Some(name) = strip_root(&header.name, root) else {
            return Ok(());
        };
        let path = self
            .guard
            .validate(name)
            .map_err(|reason| DeployError::PathTraversal {
                entry: header.name.clone(),
                reason,
            })?;
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        let target = self
            .guard
            .resolve(name)
            .map_err(|reason| DeployError::PathTraversal {
                entry: header.name.clone(),
                reason,
            })?;

        if header.kind == EntryKind::Directory {
            return sink(ArchiveItem::Directory { path, target });
        }

        if header.size > self.limits.max_file_size {
            return Err(DeployError::FileTooLarge {
                path: path.display().to_string(),
                size: header.size,
                limit: self.limits.max_file_size,
            });
        }

        let mut capped = CappedReader::new(
            content,
            self.limits.max_file_size,
            extracted,
            self.limits.max_extracted_size,
        );
        let result = sink(ArchiveItem::File {
            path: path.clone(),
            target,
            size: header.size,
            content: &mut capped,
        });

        match capped.overflow() {
            Some(Overflow::File(size)) => Err(DeployError::FileTooLarge {
                path: path.display().to_string(),
                size,
                limit: self.limits.max_file_size,
            }),
            Some(Overflow::Aggregate(size)) => Err(DeployError::ArchiveTooLarge {
                size,
                limit: self.limits.max_extracted_size,
            }),
            None => result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overflow {
    File(u64),
    Aggregate(u64),
}

/// Reader that fails once an entry or the whole extraction grows past its cap.
///
/// Never reads more than one byte beyond the per-file limit, whatever the
/// entry header claims.
struct CappedReader<'a, R: Read + ?Sized> {
    inner: &'a mut R,
    read: u64,
    file_limit: u64,
    total: &'a mut u64,
    total_limit: u64,
    overflow: Option<Overflow>,
}

impl<'a, R: Read + ?Sized> CappedReader<'a, R> {
    fn new(inner: &'a mut R, file_limit: u64, total: &'a mut u64, total_limit: u64) -> Self {
        Self {
            inner,
            read: 0,
            file_limit,
            total,
            total_limit,
            overflow: None,
        }
    }

    fn overflow(&self) -> Option<Overflow> {
        self.overflow
    }
}

impl<R: Read + ?Sized> Read for CappedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.overflow.is_some() {
            return Err(io::Error::other("size limit exceeded"));
        }

        let allowed = self.file_limit.saturating_add(1).saturating_sub(self.read);
        let len = buf.len().min(usize::try_from(allowed).unwrap_or(usize::MAX));
        if len == 0 {
            return Ok(0);
        }

        let n = self.inner.read(&mut buf[..len])?;
        self.read += n as u64;
        *self.total += n as u64;

        if self.read > self.file_limit {
            self.overflow = Some(Overflow::File(self.read));
        } else if *self.total > self.total_limit {
            self.overflow = Some(Overflow::Aggregate(*self.total));
        }
        if self.overflow.is_some() {
            return Err(io::Error::other("size limit exceeded"));
        }
        Ok(n)
    }
}
