//! Streaming compressors applied on top of differ output.
//!
//! Every codec wraps a reader and yields the transformed bytes incrementally,
//! so a patch can be compressed while it is being uploaded.

use std::fmt;
use std::io::{self, BufRead, Read};

use flate2::read::{GzDecoder, GzEncoder};

/// Boxed byte stream passed between differs, compressors and the registry.
pub type ByteStream = Box<dyn Read + Send>;

const ZSTD_LEVEL: i32 = 3;

pub trait Compressor: Send + Sync {
    /// Name used in tags and media types; empty for the identity codec.
    fn name(&self) -> &'static str;

    fn compress(&self, input: ByteStream) -> io::Result<ByteStream>;

    fn decompress(&self, input: ByteStream) -> io::Result<ByteStream>;
}

/// Passes bytes through unchanged.
pub struct Identity;

impl Compressor for Identity {
    fn name(&self) -> &'static str {
        ""
    }

    fn compress(&self, input: ByteStream) -> io::Result<ByteStream> {
        Ok(input)
    }

    fn decompress(&self, input: ByteStream) -> io::Result<ByteStream> {
        Ok(input)
    }
}

pub struct Gzip;

impl Compressor for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, input: ByteStream) -> io::Result<ByteStream> {
        let encoder = GzEncoder::new(input, flate2::Compression::default());
        Ok(Box::new(CodecReader::new("gzip compress", encoder)))
    }

    fn decompress(&self, input: ByteStream) -> io::Result<ByteStream> {
        Ok(Box::new(CodecReader::new("gzip decompress", GzDecoder::new(input))))
    }
}

pub struct Zstd;

impl Compressor for Zstd {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, input: ByteStream) -> io::Result<ByteStream> {
        let encoder = zstd::stream::read::Encoder::new(input, ZSTD_LEVEL)?;
        Ok(Box::new(CodecReader::new("zstd compress", encoder)))
    }

    fn decompress(&self, input: ByteStream) -> io::Result<ByteStream> {
        let decoder = zstd::stream::read::Decoder::new(input)?;
        Ok(Box::new(CodecReader::new("zstd decompress", decoder)))
    }
}

/// Known compressors, in upgrade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressorKind {
    Identity,
    Gzip,
    Zstd,
}

impl CompressorKind {
    pub fn name(self) -> &'static str {
        self.compressor().name()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" => Some(CompressorKind::Identity),
            "gzip" => Some(CompressorKind::Gzip),
            "zstd" => Some(CompressorKind::Zstd),
            _ => None,
        }
    }

    /// Guess the codec of a layer from the suffix of its media type.
    pub fn from_media_type(media_type: &str) -> Self {
        if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
            CompressorKind::Gzip
        } else if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
            CompressorKind::Zstd
        } else {
            CompressorKind::Identity
        }
    }

    /// Recognize a codec by the magic bytes at the start of a stream.
    pub fn from_magic(head: &[u8]) -> Self {
        if head.starts_with(&[0x1f, 0x8b]) {
            CompressorKind::Gzip
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            CompressorKind::Zstd
        } else {
            CompressorKind::Identity
        }
    }

    pub fn compressor(self) -> &'static dyn Compressor {
        match self {
            CompressorKind::Identity => &Identity,
            CompressorKind::Gzip => &Gzip,
            CompressorKind::Zstd => &Zstd,
        }
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressorKind::Identity => write!(f, "identity"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Decompress a stream whose codec is only known from its content.
pub fn decompress_detected<R: BufRead + Send + 'static>(mut input: R) -> io::Result<ByteStream> {
    let kind = CompressorKind::from_magic(input.fill_buf()?);
    kind.compressor().decompress(Box::new(input))
}

/// Tags errors raised inside a codec with the codec that raised them.
struct CodecReader<R> {
    context: &'static str,
    inner: R,
}

impl<R: Read> CodecReader<R> {
    fn new(context: &'static str, inner: R) -> Self {
        Self { context, inner }
    }
}

impl<R: Read> Read for CodecReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", self.context, e)))
    }
}
