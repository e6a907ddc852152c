//! Access to the backing OCI registry.
//!
//! [`RegistryDelegate`] has four transport primitives that implementations
//! provide, and the operations the delta engine uses, built on top of them.

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use ociclient::models::{ANNOTATION_TITLE, EMPTY_JSON};
use ociclient::{Credentials, Descriptor, ImageManifest, ImageReference, OciDigest};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::compression::ByteStream;
use crate::selector::AlgorithmChoice;

mod memory;
mod oci;

pub use self::memory::MemoryRegistry;
pub use self::oci::OciRegistry;

pub const ANNOTATION_FROM: &str = "from";
pub const ANNOTATION_TO: &str = "to";
pub const ANNOTATION_IS_DUMMY: &str = "is-dummy";
pub const ANNOTATION_CREATED: &str = "created";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} is not a digest reference")]
    NotDigest(String),

    #[error("invalid artifact: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("registry error: {0}")]
    Upstream(String),
}

impl RegistryError {
    /// Classify an error reported by the registry client. The client does
    /// not expose typed errors, so authorization failures are recognized by
    /// their message.
    pub fn upstream(context: &str, err: anyhow::Error) -> Self {
        let message = format!("{}: {:#}", context, err);
        if message.to_ascii_lowercase().contains("unauthorized") {
            RegistryError::Unauthorized(message)
        } else {
            RegistryError::Upstream(message)
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A reference resolved to the digest of its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// Canonical digest reference
    pub reference: ImageReference,
    /// Descriptor of the manifest
    pub descriptor: Descriptor,
}

/// Blob content handed to [`RegistryDelegate::push_blob`].
pub enum BlobContent {
    Bytes(Bytes),
    File(tokio::fs::File),
}

/// A computed delta to store.
#[derive(Debug, Clone)]
pub struct DeltaPush {
    pub from: ImageReference,
    pub to: ImageReference,
    pub choice: AlgorithmChoice,
}

/// A lease claiming a delta location.
#[derive(Debug, Clone)]
pub struct LeasePush {
    pub from: ImageReference,
    pub to: ImageReference,
    pub choice: AlgorithmChoice,
    pub created: DateTime<Utc>,
}

impl LeasePush {
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = delta_annotations(&self.from, &self.to);
        annotations.insert(ANNOTATION_IS_DUMMY.to_string(), "true".to_string());
        annotations.insert(
            ANNOTATION_CREATED.to_string(),
            self.created.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
        annotations
    }
}

fn delta_annotations(from: &ImageReference, to: &ImageReference) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_FROM.to_string(), from.to_string());
    annotations.insert(ANNOTATION_TO.to_string(), to.to_string());
    annotations
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy a stream into an anonymous temporary file, computing its digest on
/// the way. The returned file is positioned at the start.
pub fn spool_and_hash(mut content: impl Read) -> io::Result<(std::fs::File, OciDigest, u64)> {
    let mut writer = HashingWriter {
        inner: io::BufWriter::new(tempfile::tempfile()?),
        hasher: Sha256::new(),
        written: 0,
    };
    io::copy(&mut content, &mut writer)?;

    let HashingWriter { inner, hasher, written } = writer;
    let mut file = inner.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;

    Ok((file, OciDigest::from_hasher(hasher), written))
}

#[async_trait]
pub trait RegistryDelegate: Send + Sync {
    /// Fetch a manifest and its descriptor. `None` if it does not exist.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
    ) -> Result<Option<(Descriptor, ImageManifest)>>;

    /// Stream a blob of the reference's repository into `file`.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        file: &mut tokio::fs::File,
        credentials: Option<&Credentials>,
    ) -> Result<()>;

    /// Upload a blob unless the repository already has it.
    async fn push_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        content: BlobContent,
        credentials: Option<&Credentials>,
    ) -> Result<()>;

    /// Store a manifest under the reference's tag, returning its descriptor.
    async fn push_manifest(
        &self,
        target: &ImageReference,
        manifest: &ImageManifest,
        credentials: Option<&Credentials>,
    ) -> Result<Descriptor>;

    /// Resolve a reference to the digest of its manifest.
    async fn resolve(
        &self,
        reference: &ImageReference,
        expect_digest: bool,
        credentials: Option<&Credentials>,
    ) -> Result<Resolved> {
        if expect_digest && !reference.is_digest() {
            return Err(RegistryError::NotDigest(reference.to_string()));
        }

        let (descriptor, _) = self
            .fetch_manifest(reference, credentials)
            .await?
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))?;

        if let Some(digest) = reference.digest() {
            if digest != &descriptor.digest {
                return Err(RegistryError::Invalid(format!(
                    "{} was served with digest {}",
                    reference, descriptor.digest
                )));
            }
        }

        Ok(Resolved {
            reference: reference.to_digest(descriptor.digest.clone()),
            descriptor,
        })
    }

    async fn load_manifest(
        &self,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
    ) -> Result<ImageManifest> {
        self.fetch_manifest(reference, credentials)
            .await?
            .map(|(_, manifest)| manifest)
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))
    }

    /// Fetch the sole content blob of an artifact into a temporary file
    /// positioned at the start.
    async fn load_artifact(
        &self,
        reference: &ImageReference,
        manifest: &ImageManifest,
        credentials: Option<&Credentials>,
    ) -> Result<std::fs::File> {
        let descriptor = match manifest.content() {
            [descriptor] => descriptor,
            [] => return Err(RegistryError::NotFound(format!("{} has no content", reference))),
            content => {
                return Err(RegistryError::Invalid(format!(
                    "{} has {} content blobs, expected one",
                    reference,
                    content.len()
                )));
            }
        };

        let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
        self.fetch_blob(reference, descriptor, &mut file, credentials).await?;

        let mut file = file.into_std().await;
        file.seek(SeekFrom::Start(0))?;
        debug!("Loaded {} ({} bytes) of {}", descriptor.digest, descriptor.size, reference);
        Ok(file)
    }

    /// Upload a delta and tag it at `target`, replacing any lease stored there.
    async fn push_delta(
        &self,
        target: &ImageReference,
        push: DeltaPush,
        content: ByteStream,
        credentials: Option<&Credentials>,
    ) -> Result<Resolved> {
        let (file, digest, size) = tokio::task::spawn_blocking(move || spool_and_hash(content))
            .await
            .map_err(|e| RegistryError::Upstream(format!("spool task failed: {}", e)))??;

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_TITLE.to_string(), push.choice.file_name());
        let layer = Descriptor {
            media_type: push.choice.media_type(),
            digest,
            size,
            annotations,
        };

        self.push_blob(target, &layer, BlobContent::File(tokio::fs::File::from_std(file)), credentials)
            .await?;
        self.push_blob(target, &Descriptor::empty(), BlobContent::Bytes(Bytes::from_static(EMPTY_JSON)), credentials)
            .await?;

        let manifest = ImageManifest::pack(
            push.choice.media_type(),
            vec![layer],
            delta_annotations(&push.from, &push.to),
        );
        let descriptor = self.push_manifest(target, &manifest, credentials).await?;

        info!("Pushed delta {} ({} bytes) to {}", descriptor.digest, size, target);
        Ok(Resolved {
            reference: target.to_digest(descriptor.digest.clone()),
            descriptor,
        })
    }

    /// Tag a lease manifest at `target`.
    async fn push_dummy(
        &self,
        target: &ImageReference,
        lease: LeasePush,
        credentials: Option<&Credentials>,
    ) -> Result<Descriptor> {
        let empty = Descriptor::empty();
        self.push_blob(target, &empty, BlobContent::Bytes(Bytes::from_static(EMPTY_JSON)), credentials)
            .await?;

        let manifest = ImageManifest::pack(lease.choice.media_type(), vec![empty], lease.annotations());
        let descriptor = self.push_manifest(target, &manifest, credentials).await?;

        debug!("Pushed lease {} to {}", descriptor.digest, target);
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_spool_and_hash() {
        let (mut file, digest, size) = spool_and_hash(Cursor::new(b"hello".to_vec())).unwrap();
        assert_eq!(size, 5);
        assert_eq!(digest, OciDigest::sha256_of(b"hello"));

        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hello");
    }

    #[test]
    fn test_unauthorized_is_sniffed() {
        let err = RegistryError::upstream("query manifest", anyhow::anyhow!("Failed to query manifest: unauthorized (401)"));
        assert!(matches!(err, RegistryError::Unauthorized(_)));

        let err = RegistryError::upstream("query manifest", anyhow::anyhow!("connection refused"));
        assert!(matches!(err, RegistryError::Upstream(_)));
    }

    #[test]
    fn test_lease_annotations() {
        let from: ImageReference = "registry.example.com/app@sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        let to = from.clone();
        let created = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let lease = LeasePush { from, to, choice: AlgorithmChoice::default(), created };

        let annotations = lease.annotations();
        assert_eq!(annotations[ANNOTATION_IS_DUMMY], "true");
        assert_eq!(annotations[ANNOTATION_CREATED], "2024-05-01T10:00:00Z");
        assert!(annotations[ANNOTATION_FROM].contains("@sha256:"));
    }
}
