//! Validation of archive entry names

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Reason an entry name was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRejection {
    TooLong,
    NullByte,
    Absolute,
    ParentReference,
    EscapesRoot,
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            PathRejection::TooLong => "path too long",
            PathRejection::NullByte => "null byte in path",
            PathRejection::Absolute => "absolute path",
            PathRejection::ParentReference => "parent directory reference",
            PathRejection::EscapesRoot => "path escapes extraction root",
        };
        f.write_str(reason)
    }
}

/// Checks untrusted entry names against an extraction root.
///
/// Every rule is lexical. The filesystem is never consulted.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
    max_path_length: usize,
}

impl PathGuard {
    pub fn new(root: impl Into<PathBuf>, max_path_length: usize) -> Self {
        Self {
            root: normalize(&root.into()),
            max_path_length,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a raw entry name and return the clean relative path.
    ///
    /// An empty result means the name refers to the root itself.
    pub fn validate(&self, raw: &str) -> Result<PathBuf, PathRejection> {
        if raw.chars().count() > self.max_path_length {
            return Err(PathRejection::TooLong);
        }
        if raw.contains('\0') {
            return Err(PathRejection::NullByte);
        }
        if is_absolute(raw) {
            return Err(PathRejection::Absolute);
        }
        if raw.contains("..") {
            return Err(PathRejection::ParentReference);
        }

        let mut clean: Vec<&str> = Vec::new();
        for part in raw.split(['/', '\\']) {
            match part {
                "" | "." => {}
                ".." => {
                    if clean.pop().is_none() {
                        return Err(PathRejection::ParentReference);
                    }
                }
                name => clean.push(name),
            }
        }

        Ok(clean.iter().collect())
    }

    /// Validate a raw entry name and join it onto the root.
    ///
    /// The joined path must lie strictly below the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, PathRejection> {
        let relative = self.validate(raw)?;
        let target = normalize(&self.root.join(relative));
        if target == self.root || !target.starts_with(&self.root) {
            return Err(PathRejection::EscapesRoot);
        }
        Ok(target)
    }
}

fn is_absolute(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if matches!(bytes.first(), Some(b'/') | Some(b'\\')) {
        return true;
    }
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
