//! Absolute, slash-separated artifact paths.
//!
//! Paths compare by their segment sequence, so `/a/b` sorts before `/a/b/c`
//! and `/a/c`. The root has no parent; every other path's parent is the
//! path with its last segment dropped.

use std::fmt;
use std::str::FromStr;

use crate::error::{RasError, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ArtifactPath {
    segments: Vec<String>,
}

impl ArtifactPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse an absolute path. Repeated and trailing slashes are ignored;
    /// `.` and `..` segments are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(RasError::InvalidPath {
                path: path.to_string(),
                reason: "path must be absolute".to_string(),
            });
        }
        let mut segments = Vec::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(RasError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("relative segment '{}'", segment),
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// `None` for the root.
    pub fn parent(&self) -> Option<ArtifactPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Every ancestor from the root down, excluding `self`.
    pub fn ancestors(&self) -> impl Iterator<Item = ArtifactPath> + '_ {
        (0..self.segments.len()).map(move |n| Self {
            segments: self.segments[..n].to_vec(),
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Append one segment. Slashes inside `segment` are not interpreted.
    pub fn join(&self, segment: &str) -> Result<ArtifactPath> {
        if segment.is_empty() || segment.contains('/') || segment == "." || segment == ".." {
            return Err(RasError::InvalidPath {
                path: format!("{}/{}", self, segment),
                reason: "invalid segment".to_string(),
            });
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    pub fn starts_with(&self, prefix: &ArtifactPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for ArtifactPath {
    type Err = RasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
