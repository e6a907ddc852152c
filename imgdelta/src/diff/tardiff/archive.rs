//! Raw tar header handling shared by the archive differ and the old-archive source.

use std::borrow::Cow;
use std::io::{self, Read};

use tar::{EntryType, Header};

pub(crate) const BLOCK_SIZE: u64 = 512;

/// Largest GNU long name or PAX record accepted.
pub(crate) const MAX_EXTENSION_LEN: u64 = 1 << 20;

/// Size of an entry's data rounded up to whole blocks.
pub(crate) fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE).saturating_mul(BLOCK_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderKind {
    /// GNU long name record for the next entry
    LongName,
    /// PAX extended header for the next entry
    Pax,
    /// Regular file content
    File,
    /// Anything else (directories, links, global headers, devices)
    Other,
}

#[derive(Debug, Clone)]
pub(crate) struct HeaderInfo {
    pub kind: HeaderKind,
    pub size: u64,
    pub path: String,
}

/// Parse one header block. `None` marks the end-of-archive zero block.
pub(crate) fn parse_header(block: &[u8; BLOCK_SIZE as usize]) -> io::Result<Option<HeaderInfo>> {
    if block.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    let header = Header::from_byte_slice(block);
    let size = header
        .entry_size()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad tar header: {}", e)))?;

    let kind = match header.entry_type() {
        EntryType::GNULongName => HeaderKind::LongName,
        EntryType::XHeader => HeaderKind::Pax,
        EntryType::Regular | EntryType::Continuous => HeaderKind::File,
        _ => HeaderKind::Other,
    };
    if matches!(kind, HeaderKind::LongName | HeaderKind::Pax) && size > MAX_EXTENSION_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("tar extension record of {} bytes exceeds {}", size, MAX_EXTENSION_LEN),
        ));
    }

    let path = match header.path_bytes() {
        Cow::Borrowed(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Cow::Owned(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    };

    Ok(Some(HeaderInfo { kind, size, path }))
}

/// Name stored in a GNU long name record.
pub(crate) fn long_name(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Overrides a PAX extended header sets for the next entry.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PaxRecords {
    pub path: Option<String>,
    pub size: Option<u64>,
}

/// Parse the `path` and `size` records of a PAX extended header. Parsing
/// stops at the first malformed record.
pub(crate) fn pax_records(data: &[u8]) -> PaxRecords {
    let mut records = PaxRecords::default();
    let mut rest = data;

    while !rest.is_empty() {
        let Some(space) = rest.iter().position(|&b| b == b' ') else {
            break;
        };
        let Some(len) = std::str::from_utf8(&rest[..space]).ok().and_then(|n| n.parse::<usize>().ok()) else {
            break;
        };
        if len <= space + 1 || len > rest.len() {
            break;
        }

        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            records.path = Some(String::from_utf8_lossy(value).into_owned());
        } else if let Some(value) = record.strip_prefix(b"size=") {
            records.size = std::str::from_utf8(value).ok().and_then(|v| v.parse().ok());
        }
        rest = &rest[len..];
    }

    records
}

/// Metadata carried by extension records over to the entry that follows them.
#[derive(Debug, Default)]
pub(crate) struct PendingMeta {
    path: Option<String>,
    size: Option<u64>,
}

impl PendingMeta {
    /// Record the content of a long name or PAX header.
    pub(crate) fn absorb(&mut self, kind: HeaderKind, data: &[u8]) {
        match kind {
            HeaderKind::LongName => self.path = Some(long_name(data)),
            HeaderKind::Pax => {
                let records = pax_records(data);
                if records.path.is_some() {
                    self.path = records.path;
                }
                if records.size.is_some() {
                    self.size = records.size;
                }
            }
            HeaderKind::File | HeaderKind::Other => {}
        }
    }

    /// Apply and clear the pending overrides for a regular header.
    pub(crate) fn resolve(&mut self, info: HeaderInfo) -> HeaderInfo {
        let pending = std::mem::take(self);
        HeaderInfo {
            kind: info.kind,
            size: pending.size.unwrap_or(info.size),
            path: pending.path.unwrap_or(info.path),
        }
    }
}

/// Archive member names are compared without leading `./` or `/` and trailing `/`.
pub(crate) fn normalize(name: &str) -> String {
    let mut name = name;
    loop {
        if let Some(stripped) = name.strip_prefix("./") {
            name = stripped;
        } else if let Some(stripped) = name.strip_prefix('/') {
            name = stripped;
        } else {
            break;
        }
    }
    name.trim_end_matches('/').to_string()
}

/// Fill `buf` completely; `Ok(false)` when the stream ended before the first byte.
pub(crate) fn read_block<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "tar archive truncated"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
