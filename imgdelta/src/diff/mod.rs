//! Differ/patcher pairs.
//!
//! A differ turns two versions of an artifact into a patch stream; the
//! matching patcher rebuilds the new version from the old one and the patch.
//! Implementations hold no state, so independent pairs can be processed
//! concurrently.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::compression::ByteStream;

pub mod bsdiff;
pub mod tardiff;

pub use self::bsdiff::BsDiff;
pub use self::tardiff::TarDiff;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),
}

pub type Result<T> = std::result::Result<T, DiffError>;

pub trait Differ: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute a patch that turns `old` into `new`.
    fn diff(&self, old: ByteStream, new: ByteStream) -> Result<ByteStream>;
}

pub trait Patcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rebuild the new version from `old` and a patch produced by the matching differ.
    fn patch(&self, old: ByteStream, patch: ByteStream) -> Result<ByteStream>;
}

/// Known differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DifferKind {
    Bsdiff,
    Tardiff,
}

impl DifferKind {
    pub fn name(self) -> &'static str {
        match self {
            DifferKind::Bsdiff => "bsdiff",
            DifferKind::Tardiff => "tardiff",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bsdiff" => Some(DifferKind::Bsdiff),
            "tardiff" => Some(DifferKind::Tardiff),
            _ => None,
        }
    }

    pub fn differ(self) -> &'static dyn Differ {
        match self {
            DifferKind::Bsdiff => &BsDiff,
            DifferKind::Tardiff => &TarDiff,
        }
    }

    pub fn patcher(self) -> &'static dyn Patcher {
        match self {
            DifferKind::Bsdiff => &BsDiff,
            DifferKind::Tardiff => &TarDiff,
        }
    }

    /// Whether the differ needs decompressed archives as input.
    pub fn wants_plain_archives(self) -> bool {
        matches!(self, DifferKind::Tardiff)
    }
}

impl fmt::Display for DifferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
