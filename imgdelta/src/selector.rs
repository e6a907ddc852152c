//! Picks the differ and compressor for a pair of artifacts.

use std::fmt;

use ociclient::ImageManifest;

use crate::compression::{Compressor, CompressorKind};
use crate::diff::{DifferKind, Differ, Patcher};

/// Annotation marking the sole layer as a tar archive of a directory tree.
pub const ANNOTATION_UNPACK: &str = "unpack";

/// Algorithms used when the client does not say what it accepts.
pub const DEFAULT_ACCEPTED: [&str; 2] = ["bsdiff", "tardiff"];

/// A differ together with the compressor applied to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgorithmChoice {
    pub differ: DifferKind,
    pub compressor: CompressorKind,
}

impl AlgorithmChoice {
    pub fn new(differ: DifferKind, compressor: CompressorKind) -> Self {
        Self { differ, compressor }
    }

    fn join(&self, separator: char) -> String {
        match self.compressor {
            CompressorKind::Identity => self.differ.name().to_string(),
            compressor => format!("{}{}{}", self.differ.name(), separator, compressor.name()),
        }
    }

    /// Tag the delta is stored under: `differ[_compressor]`.
    pub fn tag(&self) -> String {
        self.join('_')
    }

    /// `application/differ[+compressor]`
    pub fn media_type(&self) -> String {
        format!("application/{}", self.join('+'))
    }

    /// `differ[.compressor]`
    pub fn file_extension(&self) -> String {
        self.join('.')
    }

    /// File name recorded in the title annotation of the delta layer.
    pub fn file_name(&self) -> String {
        format!("delta.{}", self.file_extension())
    }

    /// Recover the choice from a delta tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let (differ, compressor) = match tag.split_once('_') {
            Some((differ, compressor)) if !compressor.is_empty() => (differ, compressor),
            Some(_) => return None,
            None => (tag, ""),
        };

        Some(Self {
            differ: DifferKind::from_name(differ)?,
            compressor: CompressorKind::from_name(compressor)?,
        })
    }

    pub fn differ_impl(&self) -> &'static dyn Differ {
        self.differ.differ()
    }

    pub fn patcher_impl(&self) -> &'static dyn Patcher {
        self.differ.patcher()
    }

    pub fn compressor_impl(&self) -> &'static dyn Compressor {
        self.compressor.compressor()
    }
}

impl Default for AlgorithmChoice {
    fn default() -> Self {
        Self::new(DifferKind::Bsdiff, CompressorKind::Identity)
    }
}

impl fmt::Display for AlgorithmChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Whether the artifact is flagged as an archive to unpack. The layer
/// annotation takes precedence over the manifest annotation.
pub fn is_unpacked(manifest: &ImageManifest) -> bool {
    let layer_flag = match manifest.content() {
        [layer] => layer.annotation(ANNOTATION_UNPACK),
        _ => None,
    };

    layer_flag.or_else(|| manifest.annotation(ANNOTATION_UNPACK)) == Some("true")
}

/// Choose the algorithms for a delta between two compatible manifests.
pub fn select<S: AsRef<str>>(accepted: &[S], from: &ImageManifest, to: &ImageManifest) -> AlgorithmChoice {
    let accepts = |name: &str| accepted.iter().any(|a| a.as_ref() == name);
    let mut choice = AlgorithmChoice::default();

    if is_unpacked(from) && is_unpacked(to) && accepts(DifferKind::Tardiff.name()) {
        choice.differ = DifferKind::Tardiff;
    }

    if accepts(CompressorKind::Gzip.name()) {
        choice.compressor = CompressorKind::Gzip;
    }
    if accepts(CompressorKind::Zstd.name()) {
        choice.compressor = CompressorKind::Zstd;
    }

    choice
}

#[cfg(test)]
mod tests {
    use super::*;
    use ociclient::Descriptor;
    use std::collections::BTreeMap;

    fn manifest(unpack: Option<&str>) -> ImageManifest {
        let mut layer = Descriptor::for_content("application/vnd.oci.image.layer.v1.tar", b"layer");
        if let Some(unpack) = unpack {
            layer.annotations.insert(ANNOTATION_UNPACK.to_string(), unpack.to_string());
        }
        ImageManifest::pack("application/vnd.example", vec![layer], BTreeMap::new())
    }

    #[test]
    fn test_defaults() {
        let choice = select::<&str>(&[], &manifest(None), &manifest(None));
        assert_eq!(choice, AlgorithmChoice::new(DifferKind::Bsdiff, CompressorKind::Identity));
        assert_eq!(choice.tag(), "bsdiff");
        assert_eq!(choice.media_type(), "application/bsdiff");
        assert_eq!(choice.file_name(), "delta.bsdiff");
    }

    #[test]
    fn test_tardiff_needs_both_sides_unpacked() {
        let accepted = ["bsdiff", "tardiff"];
        let unpacked = manifest(Some("true"));
        let plain = manifest(None);

        assert_eq!(select(&accepted, &unpacked, &unpacked).differ, DifferKind::Tardiff);
        assert_eq!(select(&accepted, &unpacked, &plain).differ, DifferKind::Bsdiff);
        assert_eq!(select(&accepted, &manifest(Some("false")), &unpacked).differ, DifferKind::Bsdiff);
        assert_eq!(select(&["bsdiff"], &unpacked, &unpacked).differ, DifferKind::Bsdiff);
    }

    #[test]
    fn test_manifest_level_unpack_flag() {
        let mut manifest = manifest(None);
        manifest.annotations.insert(ANNOTATION_UNPACK.to_string(), "true".to_string());
        assert!(is_unpacked(&manifest));

        manifest.layers[0].annotations.insert(ANNOTATION_UNPACK.to_string(), "false".to_string());
        assert!(!is_unpacked(&manifest));
    }

    #[test]
    fn test_zstd_wins_over_gzip() {
        let m = manifest(None);
        assert_eq!(select(&["gzip"], &m, &m).compressor, CompressorKind::Gzip);
        assert_eq!(select(&["zstd", "gzip"], &m, &m).compressor, CompressorKind::Zstd);
        assert_eq!(select(&["gzip", "zstd"], &m, &m).compressor, CompressorKind::Zstd);

        let unpacked = manifest(Some("true"));
        let choice = select(&["tardiff", "gzip"], &unpacked, &unpacked);
        assert_eq!(choice.tag(), "tardiff_gzip");
        assert_eq!(choice.media_type(), "application/tardiff+gzip");
        assert_eq!(choice.file_extension(), "tardiff.gzip");
    }

    #[test]
    fn test_tag_roundtrip() {
        for differ in [DifferKind::Bsdiff, DifferKind::Tardiff] {
            for compressor in [CompressorKind::Identity, CompressorKind::Gzip, CompressorKind::Zstd] {
                let choice = AlgorithmChoice::new(differ, compressor);
                assert_eq!(AlgorithmChoice::from_tag(&choice.tag()), Some(choice));
            }
        }

        assert_eq!(AlgorithmChoice::from_tag("xdelta"), None);
        assert_eq!(AlgorithmChoice::from_tag("bsdiff_"), None);
        assert_eq!(AlgorithmChoice::from_tag("bsdiff_lzma"), None);
    }
}
