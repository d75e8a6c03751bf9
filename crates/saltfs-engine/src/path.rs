//! Forward-slash paths into the manifest tree.
//!
//! `/` is the root. Components are byte-compared names; empty names, names
//! containing `/`, and the `.` / `..` components are rejected; callers
//! (mountpoint adapters) are expected to resolve those before reaching the
//! engine.

use std::fmt;
use std::str::FromStr;

use saltfs_core::FsError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    parts: Vec<String>,
}

impl FsPath {
    pub fn root() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Final component, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.parts.last().map(String::as_str)
    }

    /// Containing path, `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.parts.is_empty() {
            return None;
        }
        Some(FsPath {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, name: &str) -> FsPath {
        let mut parts = self.parts.clone();
        parts.push(name.to_string());
        FsPath { parts }
    }

    /// True when `self` equals `other` or lives underneath it.
    pub fn starts_with(&self, other: &FsPath) -> bool {
        self.parts.len() >= other.parts.len() && self.parts[..other.parts.len()] == other.parts[..]
    }
}

impl FromStr for FsPath {
    type Err = FsError;

    fn from_str(raw: &str) -> Result<Self, FsError> {
        if !raw.starts_with('/') {
            return Err(FsError::InvalidPath(format!("not absolute: `{raw}`")));
        }
        let mut parts = Vec::new();
        for comp in raw.split('/').skip(1) {
            match comp {
                // Allow a single trailing slash ("/a/" == "/a")
                "" => {
                    return if parts.len() + 1 == raw.matches('/').count() {
                        Ok(FsPath { parts })
                    } else {
                        Err(FsError::InvalidPath(format!("empty component in `{raw}`")))
                    };
                }
                "." | ".." => {
                    return Err(FsError::InvalidPath(format!(
                        "`{comp}` component not supported in `{raw}`"
                    )))
                }
                name => parts.push(name.to_string()),
            }
        }
        Ok(FsPath { parts })
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return write!(f, "/");
        }
        for part in &self.parts {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}
