use ociclient::{ImageReference, OciDigest};
use sha2::{Digest, Sha256};

use crate::selector::AlgorithmChoice;

/// Where the delta between two artifact versions is stored.
///
/// The repository is derived from the two manifest digests alone and the
/// tag from the algorithm choice, so every replica computing the same delta
/// writes to the same place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeltaLocation {
    pub reference: ImageReference,
}

fn hashed(digest: &OciDigest) -> String {
    hex::encode(Sha256::digest(digest.to_string().as_bytes()))
}

impl DeltaLocation {
    pub fn locate(host: &str, prefix: &str, from: &OciDigest, to: &OciDigest, choice: &AlgorithmChoice) -> Self {
        let prefix = prefix.trim_matches('/');
        let name = if prefix.is_empty() {
            format!("{}/{}", hashed(from), hashed(to))
        } else {
            format!("{}/{}/{}", prefix, hashed(from), hashed(to))
        };

        Self {
            reference: ImageReference::with_tag(host, name, choice.tag()),
        }
    }

    /// Key of the location in the active request set.
    pub fn key(&self) -> String {
        self.reference.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressorKind;
    use crate::diff::DifferKind;

    fn digest(content: &[u8]) -> OciDigest {
        OciDigest::sha256_of(content)
    }

    #[test]
    fn test_locate_is_deterministic() {
        let choice = AlgorithmChoice::new(DifferKind::Bsdiff, CompressorKind::Zstd);
        let a = DeltaLocation::locate("registry.example.com", "deltas", &digest(b"a"), &digest(b"b"), &choice);
        let b = DeltaLocation::locate("registry.example.com", "deltas", &digest(b"a"), &digest(b"b"), &choice);
        assert_eq!(a, b);
        assert_eq!(a.reference.hostname, "registry.example.com");
        assert_eq!(a.reference.reference(), "bsdiff_zstd");

        let components: Vec<&str> = a.reference.name.split('/').collect();
        assert_eq!(components.len(), 3);
        assert_eq!(components[0], "deltas");
        assert_eq!(components[1], hashed(&digest(b"a")));
        assert_eq!(components[1].len(), 64);
    }

    #[test]
    fn test_locate_depends_on_direction_and_choice() {
        let bsdiff = AlgorithmChoice::default();
        let tardiff = AlgorithmChoice::new(DifferKind::Tardiff, CompressorKind::Identity);
        let forward = DeltaLocation::locate("r.example.com", "deltas", &digest(b"a"), &digest(b"b"), &bsdiff);
        let backward = DeltaLocation::locate("r.example.com", "deltas", &digest(b"b"), &digest(b"a"), &bsdiff);
        let other = DeltaLocation::locate("r.example.com", "deltas", &digest(b"a"), &digest(b"b"), &tardiff);

        assert_ne!(forward.reference.name, backward.reference.name);
        assert_eq!(forward.reference.name, other.reference.name);
        assert_ne!(forward.key(), other.key());
    }

    #[test]
    fn test_empty_prefix() {
        let location = DeltaLocation::locate("r.example.com", "/", &digest(b"a"), &digest(b"b"), &AlgorithmChoice::default());
        assert_eq!(location.reference.name.split('/').count(), 2);
        assert!(location.key().parse::<ImageReference>().is_ok());
    }
}
