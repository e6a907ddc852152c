use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ociclient::models::{EMPTY_JSON, MEDIA_TYPE_IMAGE_MANIFEST};
use ociclient::{Credentials, Descriptor, Identifier, ImageManifest, ImageReference, OciDigest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use super::{BlobContent, RegistryDelegate, RegistryError, Result};
use crate::selector::ANNOTATION_UNPACK;

#[derive(Default)]
struct Store {
    blobs: HashMap<(String, OciDigest), Bytes>,
    manifests: HashMap<(String, OciDigest), (Descriptor, ImageManifest)>,
    tags: HashMap<(String, String), OciDigest>,
    unauthorized: HashSet<String>,
    manifest_pushes: Vec<(ImageReference, ImageManifest)>,
    blob_uploads: usize,
}

fn repository_key(reference: &ImageReference) -> String {
    format!("{}/{}", reference.hostname, reference.name)
}

/// In-process registry.
///
/// Serves any number of hosts and repositories from memory and records
/// every manifest pushed through [`RegistryDelegate`], which makes it the
/// delegate of choice for tests and local experiments.
#[derive(Default)]
pub struct MemoryRegistry {
    store: Mutex<Store>,
    latency: Option<Duration>,
    downloads: Arc<RwLock<()>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every manifest lookup, widening race windows.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Hold blob downloads until the returned guard is dropped.
    pub async fn pause_downloads(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.downloads).write_owned().await
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_access(&self, reference: &ImageReference) -> Result<()> {
        if self.store().unauthorized.contains(&repository_key(reference)) {
            return Err(RegistryError::Unauthorized(format!("access to {} denied", repository_key(reference))));
        }
        Ok(())
    }

    /// Reject every request for the repository of `reference`.
    pub fn set_unauthorized(&self, reference: &ImageReference) {
        self.store().unauthorized.insert(repository_key(reference));
    }

    /// Store a blob in the repository of `reference`.
    pub fn put_blob(&self, reference: &ImageReference, media_type: &str, content: &[u8]) -> Descriptor {
        let descriptor = Descriptor::for_content(media_type, content);
        self.store().blobs.insert(
            (repository_key(reference), descriptor.digest.clone()),
            Bytes::copy_from_slice(content),
        );
        descriptor
    }

    /// Store a manifest, tagging it when `reference` is a tag. Returns the
    /// digest reference of the stored manifest.
    pub fn put_manifest(&self, reference: &ImageReference, manifest: &ImageManifest) -> ImageReference {
        let body = serde_json::to_vec(manifest).unwrap_or_default();
        let descriptor = Descriptor::for_content(
            manifest.media_type.clone().unwrap_or_else(|| MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            &body,
        );
        let digest = descriptor.digest.clone();
        let key = repository_key(reference);

        let mut store = self.store();
        store.manifests.insert((key.clone(), digest.clone()), (descriptor, manifest.clone()));
        if let Identifier::Tag(tag) = &reference.identifier {
            store.tags.insert((key, tag.clone()), digest.clone());
        }

        reference.to_digest(digest)
    }

    /// Store a single layer artifact and tag it at `reference`.
    pub fn put_artifact(&self, reference: &ImageReference, media_type: &str, content: &[u8], unpack: bool) -> ImageReference {
        let mut layer = self.put_blob(reference, media_type, content);
        if unpack {
            layer.annotations.insert(ANNOTATION_UNPACK.to_string(), "true".to_string());
        }
        self.put_blob(reference, &Descriptor::empty().media_type, EMPTY_JSON);

        let manifest = ImageManifest::pack("application/vnd.example.artifact", vec![layer], BTreeMap::new());
        self.put_manifest(reference, &manifest)
    }

    /// Content of a stored blob.
    pub fn blob(&self, reference: &ImageReference, digest: &OciDigest) -> Option<Bytes> {
        self.store().blobs.get(&(repository_key(reference), digest.clone())).cloned()
    }

    fn lookup(&self, reference: &ImageReference) -> Option<(Descriptor, ImageManifest)> {
        let store = self.store();
        let key = repository_key(reference);
        let digest = match &reference.identifier {
            Identifier::Tag(tag) => store.tags.get(&(key.clone(), tag.clone()))?.clone(),
            Identifier::Digest(digest) => digest.clone(),
        };
        store.manifests.get(&(key, digest)).cloned()
    }

    /// Manifest currently stored at `reference`.
    pub fn manifest(&self, reference: &ImageReference) -> Option<ImageManifest> {
        self.lookup(reference).map(|(_, manifest)| manifest)
    }

    /// Manifests pushed through the delegate, in order.
    pub fn manifest_pushes(&self) -> Vec<(ImageReference, ImageManifest)> {
        self.store().manifest_pushes.clone()
    }

    /// Number of blobs uploaded through the delegate, not counting blobs
    /// that were already present.
    pub fn blob_uploads(&self) -> usize {
        self.store().blob_uploads
    }
}

#[async_trait]
impl RegistryDelegate for MemoryRegistry {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        _credentials: Option<&Credentials>,
    ) -> Result<Option<(Descriptor, ImageManifest)>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_access(reference)?;
        Ok(self.lookup(reference))
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        file: &mut tokio::fs::File,
        _credentials: Option<&Credentials>,
    ) -> Result<()> {
        let _downloads = self.downloads.read().await;
        self.check_access(reference)?;
        let content = self
            .blob(reference, &descriptor.digest)
            .ok_or_else(|| RegistryError::NotFound(format!("blob {}", descriptor.digest)))?;

        file.write_all(&content).await?;
        file.flush().await?;
        Ok(())
    }

    async fn push_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        content: BlobContent,
        _credentials: Option<&Credentials>,
    ) -> Result<()> {
        self.check_access(reference)?;
        let content = match content {
            BlobContent::Bytes(bytes) => bytes,
            BlobContent::File(mut file) => {
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer).await?;
                Bytes::from(buffer)
            }
        };

        let digest = OciDigest::sha256_of(&content);
        if digest != descriptor.digest || content.len() as u64 != descriptor.size {
            return Err(RegistryError::Invalid(format!(
                "blob content {} does not match descriptor {}",
                digest, descriptor.digest
            )));
        }

        let mut store = self.store();
        let key = (repository_key(reference), digest);
        if !store.blobs.contains_key(&key) {
            store.blobs.insert(key, content);
            store.blob_uploads += 1;
        }
        Ok(())
    }

    async fn push_manifest(
        &self,
        target: &ImageReference,
        manifest: &ImageManifest,
        _credentials: Option<&Credentials>,
    ) -> Result<Descriptor> {
        self.check_access(target)?;
        {
            let store = self.store();
            let key = repository_key(target);
            let referenced = manifest.config.iter().chain(manifest.content());
            for descriptor in referenced {
                if !store.blobs.contains_key(&(key.clone(), descriptor.digest.clone())) {
                    return Err(RegistryError::Invalid(format!("blob unknown: {}", descriptor.digest)));
                }
            }
        }

        let stored = self.put_manifest(target, manifest);
        self.store().manifest_pushes.push((target.clone(), manifest.clone()));

        self.lookup(&stored)
            .map(|(descriptor, _)| descriptor)
            .ok_or_else(|| RegistryError::Upstream(format!("manifest {} vanished", stored)))
    }
}
