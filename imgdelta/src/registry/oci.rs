use async_trait::async_trait;
use ociclient::models::MEDIA_TYPE_IMAGE_MANIFEST;
use ociclient::{Client, ClientSession, Credentials, Descriptor, ImageManifest, ImageReference};
use tracing::debug;

use super::{BlobContent, RegistryDelegate, RegistryError, Result};
use crate::config::RegistryConfig;

/// Delegate talking to registries over the OCI distribution API.
///
/// Client credentials are only ever sent to the host named in the
/// reference they accompany.
pub struct OciRegistry {
    insecure: Vec<String>,
    upload_chunk_size: usize,
}

impl OciRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            insecure: config.insecure.clone(),
            upload_chunk_size: config.upload_chunk_size,
        }
    }

    fn base_url(&self, hostname: &str) -> String {
        let scheme = if self.insecure.iter().any(|host| host == hostname) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, hostname)
    }

    fn session(&self, reference: &ImageReference, credentials: Option<&Credentials>) -> ClientSession {
        Client::new(self.base_url(&reference.hostname), credentials.cloned()).new_session(reference.name.clone())
    }
}

#[async_trait]
impl RegistryDelegate for OciRegistry {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        credentials: Option<&Credentials>,
    ) -> Result<Option<(Descriptor, ImageManifest)>> {
        let mut session = self.session(reference, credentials);
        let response = session
            .query_manifest(&reference.reference())
            .await
            .map_err(|e| RegistryError::upstream(&format!("query manifest {}", reference), e))?;

        Ok(response.map(|response| {
            let descriptor = Descriptor {
                media_type: response.media_type,
                digest: response.digest,
                size: response.size,
                annotations: Default::default(),
            };
            (descriptor, response.manifest)
        }))
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        file: &mut tokio::fs::File,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let mut session = self.session(reference, credentials);
        let written = session
            .fetch_blob_to(&descriptor.digest, file)
            .await
            .map_err(|e| RegistryError::upstream(&format!("fetch blob {}", descriptor.digest), e))?;

        if written != descriptor.size {
            return Err(RegistryError::Invalid(format!(
                "blob {} has {} bytes, descriptor declares {}",
                descriptor.digest, written, descriptor.size
            )));
        }
        Ok(())
    }

    async fn push_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        content: BlobContent,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let mut session = self.session(reference, credentials);
        let context = format!("push blob {} to {}", descriptor.digest, reference.name);

        match content {
            BlobContent::Bytes(bytes) => {
                session
                    .upload_bytes(descriptor.media_type.clone(), &bytes)
                    .await
                    .map_err(|e| RegistryError::upstream(&context, e))?;
            }
            BlobContent::File(mut file) => {
                session
                    .upload_file(descriptor, &mut file, self.upload_chunk_size)
                    .await
                    .map_err(|e| RegistryError::upstream(&context, e))?;
            }
        }

        debug!("Blob {} present in {}", descriptor.digest, reference.name);
        Ok(())
    }

    async fn push_manifest(
        &self,
        target: &ImageReference,
        manifest: &ImageManifest,
        credentials: Option<&Credentials>,
    ) -> Result<Descriptor> {
        let body = serde_json::to_vec(manifest).map_err(|e| RegistryError::Invalid(e.to_string()))?;

        let mut session = self.session(target, credentials);
        let digest = session
            .register_manifest(&target.reference(), manifest)
            .await
            .map_err(|e| RegistryError::upstream(&format!("push manifest {}", target), e))?;

        Ok(Descriptor {
            media_type: manifest.media_type.clone().unwrap_or_else(|| MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            digest,
            size: body.len() as u64,
            annotations: Default::default(),
        })
    }
}
