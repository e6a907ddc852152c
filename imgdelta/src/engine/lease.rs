use std::time::Duration;

use chrono::{DateTime, Utc};
use ociclient::{ImageManifest, OciDigest};
use tracing::warn;

use crate::registry::{ANNOTATION_CREATED, ANNOTATION_IS_DUMMY};

/// A placeholder claiming a delta location while it is being computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub created: DateTime<Utc>,
}

impl Lease {
    /// A lease is expired from `created + duration` on.
    pub fn is_expired(&self, now: DateTime<Utc>, duration: Duration) -> bool {
        let Ok(duration) = chrono::Duration::from_std(duration) else {
            return false;
        };
        match self.created.checked_add_signed(duration) {
            Some(expiry) => now >= expiry,
            None => false,
        }
    }
}

/// What is stored at a delta location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaState {
    /// A computed delta, with the digest of its manifest
    Ready(OciDigest),
    /// Someone claimed the location
    Leased(Lease),
    Absent,
}

impl DeltaState {
    /// Classify the manifest found at a delta location.
    ///
    /// A lease without a readable creation time counts as expired and gets
    /// replaced.
    pub fn classify(found: Option<(OciDigest, &ImageManifest)>) -> Self {
        let Some((digest, manifest)) = found else {
            return DeltaState::Absent;
        };

        if manifest.annotation(ANNOTATION_IS_DUMMY) != Some("true") {
            return DeltaState::Ready(digest);
        }

        let created = manifest
            .annotation(ANNOTATION_CREATED)
            .and_then(|created| DateTime::parse_from_rfc3339(created).ok())
            .map(|created| created.with_timezone(&Utc))
            .unwrap_or_else(|| {
                warn!("Lease {} has no valid creation time", digest);
                DateTime::<Utc>::MIN_UTC
            });

        DeltaState::Leased(Lease { created })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn manifest(annotations: &[(&str, &str)]) -> ImageManifest {
        let annotations: BTreeMap<String, String> =
            annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ImageManifest::pack("application/bsdiff", Vec::new(), annotations)
    }

    #[test]
    fn test_expiry_boundary() {
        let lease = Lease { created: at("2024-05-01T10:00:00Z") };
        let window = Duration::from_secs(300);

        assert!(!lease.is_expired(at("2024-05-01T10:00:00Z"), window));
        assert!(!lease.is_expired(at("2024-05-01T10:04:59.999Z"), window));
        assert!(lease.is_expired(at("2024-05-01T10:05:00Z"), window));
        assert!(lease.is_expired(at("2024-05-01T11:00:00Z"), window));
    }

    #[test]
    fn test_huge_window_never_expires() {
        let lease = Lease { created: at("2024-05-01T10:00:00Z") };
        assert!(!lease.is_expired(at("2100-01-01T00:00:00Z"), Duration::MAX));
    }

    #[test]
    fn test_classify() {
        let digest = OciDigest::sha256_of(b"manifest");
        assert_eq!(DeltaState::classify(None), DeltaState::Absent);

        let delta = manifest(&[("from", "a"), ("to", "b")]);
        assert_eq!(DeltaState::classify(Some((digest.clone(), &delta))), DeltaState::Ready(digest.clone()));

        let lease = manifest(&[("is-dummy", "true"), ("created", "2024-05-01T10:00:00Z")]);
        assert_eq!(
            DeltaState::classify(Some((digest.clone(), &lease))),
            DeltaState::Leased(Lease { created: at("2024-05-01T10:00:00Z") })
        );

        let broken = manifest(&[("is-dummy", "true"), ("created", "yesterday")]);
        let DeltaState::Leased(lease) = DeltaState::classify(Some((digest, &broken))) else {
            panic!("expected a lease");
        };
        assert!(lease.is_expired(Utc::now(), Duration::from_secs(300)));
    }

    #[test]
    fn test_sub_second_lease_survives_round_trip() {
        let from: ociclient::ImageReference = format!("registry.example.com/app@{}", OciDigest::sha256_of(b"v1"))
            .parse()
            .unwrap();
        let lease = crate::registry::LeasePush {
            from: from.clone(),
            to: from,
            choice: crate::selector::AlgorithmChoice::default(),
            created: at("2024-05-01T10:00:00.900Z"),
        };
        let stored = ImageManifest::pack("application/bsdiff", Vec::new(), lease.annotations());

        let DeltaState::Leased(read) = DeltaState::classify(Some((OciDigest::sha256_of(b"lease"), &stored))) else {
            panic!("expected a lease");
        };
        assert_eq!(read.created, lease.created);

        let window = Duration::from_secs(300);
        assert!(!read.is_expired(at("2024-05-01T10:05:00.500Z"), window));
        assert!(read.is_expired(at("2024-05-01T10:05:00.900Z"), window));
    }
}
