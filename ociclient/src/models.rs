use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::digest::OciDigest;

/// Media type of an OCI image manifest
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of the OCI empty descriptor
pub const MEDIA_TYPE_EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";

/// Content of the OCI empty descriptor
pub const EMPTY_JSON: &[u8] = b"{}";

/// Annotation carrying the file name of a layer
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Represents a descriptor for a content blob in an OCI registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Digest of the referenced content
    pub digest: OciDigest,
    /// Size of the referenced content in bytes
    pub size: u64,
    /// Optional annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Descriptor of the given content
    pub fn for_content(media_type: impl Into<String>, content: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: OciDigest::sha256_of(content),
            size: content.len() as u64,
            annotations: BTreeMap::new(),
        }
    }

    /// The OCI empty descriptor (`{}`)
    pub fn empty() -> Self {
        Self::for_content(MEDIA_TYPE_EMPTY_JSON, EMPTY_JSON)
    }

    /// Look up an annotation
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Represents an OCI image manifest
///
/// Older artifact manifests list their content under `blobs` instead of
/// `layers`; both are accepted when reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version of the manifest
    pub schema_version: i32,
    /// Media type of the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type for non-image artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Descriptor for the config blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    /// Descriptors for the layer blobs
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Legacy artifact manifest content
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blobs: Vec<Descriptor>,
    /// Optional annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    /// Pack an OCI image manifest around the given layers
    pub fn pack(artifact_type: impl Into<String>, layers: Vec<Descriptor>, annotations: BTreeMap<String, String>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            artifact_type: Some(artifact_type.into()),
            config: Some(Descriptor::empty()),
            layers,
            blobs: Vec::new(),
            annotations,
        }
    }

    /// The content descriptors, falling back to the legacy `blobs` field
    pub fn content(&self) -> &[Descriptor] {
        if self.layers.is_empty() {
            &self.blobs
        } else {
            &self.layers
        }
    }

    /// Look up an annotation
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_wire_format() {
        let mut annotations = BTreeMap::new();
        annotations.insert("from".to_string(), "a".to_string());
        let manifest = ImageManifest::pack("application/bsdiff", vec![Descriptor::for_content("application/bsdiff", b"patch")], annotations);

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], MEDIA_TYPE_IMAGE_MANIFEST);
        assert_eq!(json["config"]["mediaType"], MEDIA_TYPE_EMPTY_JSON);
        assert_eq!(json["layers"][0]["size"], 5);
        assert_eq!(json["annotations"]["from"], "a");
        assert!(json.get("blobs").is_none());
    }

    #[test]
    fn test_legacy_blobs_fallback() {
        let json = serde_json::json!({
            "schemaVersion": 2,
            "blobs": [{
                "mediaType": "application/octet-stream",
                "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "size": 0
            }]
        });
        let manifest: ImageManifest = serde_json::from_value(json).unwrap();
        assert!(manifest.layers.is_empty());
        assert_eq!(manifest.content().len(), 1);
    }
}
