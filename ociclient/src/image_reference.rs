use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::digest::OciDigest;

/// Error type for image reference parsing
#[derive(Debug, Error)]
pub enum ImageReferenceError {
    #[error("Invalid image reference format: {0}")]
    InvalidFormat(String),
    #[error("Image reference {0} has no registry host")]
    MissingHostname(String),
}

/// Tag or digest part of an image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Tag(String),
    Digest(OciDigest),
}

/// Represents an OCI image reference: `host/repository(:tag|@digest)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, including the port if any
    pub hostname: String,
    /// Repository path
    pub name: String,
    /// Tag or digest
    pub identifier: Identifier,
}

impl ImageReference {
    /// Create a new tag reference
    pub fn with_tag(hostname: impl Into<String>, name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            name: name.into(),
            identifier: Identifier::Tag(tag.into()),
        }
    }

    /// Create a new digest reference
    pub fn with_digest(hostname: impl Into<String>, name: impl Into<String>, digest: OciDigest) -> Self {
        Self {
            hostname: hostname.into(),
            name: name.into(),
            identifier: Identifier::Digest(digest),
        }
    }

    /// Whether this reference pins a content digest
    pub fn is_digest(&self) -> bool {
        matches!(self.identifier, Identifier::Digest(_))
    }

    /// The digest, if this is a digest reference
    pub fn digest(&self) -> Option<&OciDigest> {
        match &self.identifier {
            Identifier::Digest(digest) => Some(digest),
            Identifier::Tag(_) => None,
        }
    }

    /// The tag or digest as used in registry API paths
    pub fn reference(&self) -> String {
        match &self.identifier {
            Identifier::Tag(tag) => tag.clone(),
            Identifier::Digest(digest) => digest.to_string(),
        }
    }

    /// Same registry and repository, pinned to the given digest
    pub fn to_digest(&self, digest: OciDigest) -> Self {
        Self::with_digest(self.hostname.clone(), self.name.clone(), digest)
    }

    /// Whether both references live in the same repository of the same registry
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.hostname == other.hostname && self.name == other.name
    }
}

fn valid_repository(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        })
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}

impl FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parse image reference in the format: hostname/name(:tag|@digest)
        let s = s.trim();

        let (hostname, remainder) = match s.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
                (host.to_string(), rest)
            }
            _ => return Err(ImageReferenceError::MissingHostname(s.to_string())),
        };

        // A digest takes precedence; tag and digest together are not accepted
        let (name, identifier) = if let Some((name, digest)) = remainder.split_once('@') {
            let digest = OciDigest::from_str(digest)
                .map_err(|e| ImageReferenceError::InvalidFormat(format!("{}: {}", s, e)))?;
            (name, Identifier::Digest(digest))
        } else {
            match remainder.rsplit_once(':') {
                Some((name, tag)) => (name, Identifier::Tag(tag.to_string())),
                None => (remainder, Identifier::Tag("latest".to_string())),
            }
        };

        if !valid_repository(name) {
            return Err(ImageReferenceError::InvalidFormat(s.to_string()));
        }
        if let Identifier::Tag(tag) = &identifier {
            if !valid_tag(tag) {
                return Err(ImageReferenceError::InvalidFormat(s.to_string()));
            }
        }

        Ok(ImageReference {
            hostname,
            name: name.to_string(),
            identifier,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Identifier::Tag(tag) => write!(f, "{}/{}:{}", self.hostname, self.name, tag),
            Identifier::Digest(digest) => write!(f, "{}/{}@{}", self.hostname, self.name, digest),
        }
    }
}
