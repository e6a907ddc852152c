//! Archive-aware differ for tar layers.
//!
//! The new archive is walked once. Headers, extension records, padding and
//! the end-of-archive trailer are stored literally; the content of each
//! regular file is encoded against the old archive's entry of the same name.
//!
//! Patch layout: magic `IMGTARD1`, then a sequence of operations, each a tag
//! byte followed by its little endian arguments:
//!
//! | op | arguments | effect |
//! |---|---|---|
//! | `DATA` | `len u64`, bytes | emit the bytes |
//! | `OPEN` | `len u32`, name | select an old entry, position 0 |
//! | `SEEK` | `offset u64` | move within the old entry |
//! | `COPY` | `len u64` | emit bytes of the old entry |
//! | `ADD` | `len u64`, bytes | emit old bytes plus the given bytes |
//! | `END` | | end of patch |

use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use tracing::debug;

use super::bsdiff;
use super::{DiffError, Differ, Patcher, Result};
use crate::compression::ByteStream;

mod archive;
mod source;

pub use self::source::{EntryRange, TarSource};

use self::archive::{BLOCK_SIZE, HeaderKind, PendingMeta};

const MAGIC: &[u8; 8] = b"IMGTARD1";

const OP_END: u8 = 0x00;
const OP_DATA: u8 = 0x01;
const OP_OPEN: u8 = 0x02;
const OP_SEEK: u8 = 0x03;
const OP_COPY: u8 = 0x04;
const OP_ADD: u8 = 0x05;

const MAX_PENDING_DATA: usize = 1024 * 1024;
const COPY_CHUNK: usize = 64 * 1024;

/// Serializes patch operations, merging adjacent literal data.
struct OpWriter<W: Write> {
    out: W,
    pending: Vec<u8>,
}

impl<W: Write> OpWriter<W> {
    fn new(mut out: W) -> io::Result<Self> {
        out.write_all(MAGIC)?;
        Ok(Self { out, pending: Vec::new() })
    }

    fn flush_data(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.out.write_all(&[OP_DATA])?;
        self.out.write_all(&(self.pending.len() as u64).to_le_bytes())?;
        self.out.write_all(&self.pending)?;
        self.pending.clear();
        Ok(())
    }

    fn data(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() >= MAX_PENDING_DATA {
            self.flush_data()?;
        }
        Ok(())
    }

    fn open(&mut self, name: &str) -> io::Result<()> {
        self.flush_data()?;
        self.out.write_all(&[OP_OPEN])?;
        self.out.write_all(&(name.len() as u32).to_le_bytes())?;
        self.out.write_all(name.as_bytes())
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.flush_data()?;
        self.out.write_all(&[OP_SEEK])?;
        self.out.write_all(&offset.to_le_bytes())
    }

    fn copy(&mut self, len: u64) -> io::Result<()> {
        self.flush_data()?;
        self.out.write_all(&[OP_COPY])?;
        self.out.write_all(&len.to_le_bytes())
    }

    fn add(&mut self, delta: &[u8]) -> io::Result<()> {
        self.flush_data()?;
        self.out.write_all(&[OP_ADD])?;
        self.out.write_all(&(delta.len() as u64).to_le_bytes())?;
        self.out.write_all(delta)
    }

    fn finish(mut self) -> io::Result<W> {
        self.flush_data()?;
        self.out.write_all(&[OP_END])?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Encode one regular file of the new archive.
fn encode_file<R: Read, W: Write>(
    source: &mut TarSource<R>,
    name: &str,
    content: &[u8],
    out: &mut OpWriter<W>,
) -> io::Result<()> {
    if content.is_empty() || !source.set_current_file(name)? {
        return out.data(content);
    }

    let mut old = Vec::new();
    source.read_to_end(&mut old)?;
    if old.is_empty() {
        return out.data(content);
    }

    out.open(name)?;
    if old == content {
        return out.copy(content.len() as u64);
    }

    let mut position = 0usize;
    for segment in bsdiff::segments(&old, content) {
        if segment.add_len > 0 {
            if segment.old_start != position {
                out.seek(segment.old_start as u64)?;
            }

            let new_part = &content[segment.new_start..segment.new_start + segment.add_len];
            let old_part = &old[segment.old_start..segment.old_start + segment.add_len];
            if new_part == old_part {
                out.copy(segment.add_len as u64)?;
            } else {
                let delta: Vec<u8> = new_part.iter().zip(old_part).map(|(n, o)| n.wrapping_sub(*o)).collect();
                out.add(&delta)?;
            }
            position = segment.old_start + segment.add_len;
        }

        let extra_start = segment.new_start + segment.add_len;
        out.data(&content[extra_start..extra_start + segment.extra_len])?;
    }

    Ok(())
}

fn read_exact_vec<R: Read + ?Sized>(reader: &mut R, len: u64) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "tar archive truncated"));
    }
    Ok(data)
}

/// Walk the new archive and write the patch operations rebuilding it.
fn encode_archive<R: Read, W: Write>(
    source: &mut TarSource<R>,
    new: &mut dyn Read,
    out: &mut OpWriter<W>,
) -> io::Result<()> {
    let mut pending = PendingMeta::default();
    let mut block = [0u8; BLOCK_SIZE as usize];
    let mut files = 0usize;

    loop {
        if !archive::read_block(new, &mut block)? {
            break;
        }

        let Some(info) = archive::parse_header(&block)? else {
            // End-of-archive marker; keep the trailer byte for byte
            out.data(&block)?;
            let mut rest = Vec::new();
            new.read_to_end(&mut rest)?;
            out.data(&rest)?;
            break;
        };

        out.data(&block)?;
        let info = match info.kind {
            HeaderKind::LongName | HeaderKind::Pax => info,
            HeaderKind::File | HeaderKind::Other => pending.resolve(info),
        };
        let padding = archive::padded(info.size) - info.size;

        match info.kind {
            HeaderKind::LongName | HeaderKind::Pax => {
                let data = read_exact_vec(new, info.size)?;
                pending.absorb(info.kind, &data);
                out.data(&data)?;
            }
            HeaderKind::File => {
                let name = archive::normalize(&info.path);
                let content = read_exact_vec(new, info.size)?;
                encode_file(source, &name, &content, out)?;
                files += 1;
            }
            HeaderKind::Other => {
                let data = read_exact_vec(new, info.size)?;
                out.data(&data)?;
            }
        }

        out.data(&read_exact_vec(new, padding)?)?;
    }

    debug!("tardiff: encoded {} files", files);
    Ok(())
}

/// Differ operating on tar entries instead of raw bytes.
pub struct TarDiff;

impl Differ for TarDiff {
    fn name(&self) -> &'static str {
        "tardiff"
    }

    fn diff(&self, old: ByteStream, mut new: ByteStream) -> Result<ByteStream> {
        let mut source = TarSource::new(old)?;
        let mut out = OpWriter::new(BufWriter::new(tempfile::tempfile()?))?;

        encode_archive(&mut source, &mut new, &mut out).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => DiffError::InvalidArchive(e.to_string()),
            _ => DiffError::Io(e),
        })?;

        let mut file = out.finish()?.into_inner().map_err(|e| DiffError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

impl Patcher for TarDiff {
    fn name(&self) -> &'static str {
        "tardiff"
    }

    fn patch(&self, old: ByteStream, mut patch: ByteStream) -> Result<ByteStream> {
        let mut magic = [0u8; 8];
        patch.read_exact(&mut magic).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DiffError::InvalidPatch("truncated header".to_string()),
            _ => DiffError::Io(e),
        })?;
        if &magic != MAGIC {
            return Err(DiffError::InvalidPatch("bad magic".to_string()));
        }

        Ok(Box::new(PatchReader {
            source: TarSource::new(old)?,
            patch,
            phase: OpPhase::Next,
            scratch: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum OpPhase {
    Next,
    Data(u64),
    Copy(u64),
    Add(u64),
    Done,
}

/// Yields the new archive while consuming patch operations.
struct PatchReader<P> {
    source: TarSource<ByteStream>,
    patch: P,
    phase: OpPhase,
    scratch: Vec<u8>,
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid tardiff patch: {}", message.into()))
}

impl<P: Read> PatchReader<P> {
    fn read_patch(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.patch.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => invalid("truncated"),
            _ => e,
        })
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_patch(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_source(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.source.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => invalid("reference past end of old entry"),
            _ => e,
        })
    }

    fn next_op(&mut self) -> io::Result<()> {
        let mut op = [0u8; 1];
        self.read_patch(&mut op)?;

        self.phase = match op[0] {
            OP_END => OpPhase::Done,
            OP_DATA => OpPhase::Data(self.read_u64()?),
            OP_COPY => OpPhase::Copy(self.read_u64()?),
            OP_ADD => OpPhase::Add(self.read_u64()?),
            OP_OPEN => {
                let mut len = [0u8; 4];
                self.read_patch(&mut len)?;
                let mut name = vec![0u8; u32::from_le_bytes(len) as usize];
                self.read_patch(&mut name)?;
                let name = String::from_utf8(name).map_err(|_| invalid("entry name is not utf-8"))?;
                if !self.source.set_current_file(&name)? {
                    return Err(invalid(format!("old archive has no entry {}", name)));
                }
                OpPhase::Next
            }
            OP_SEEK => {
                let offset = self.read_u64()?;
                self.source
                    .seek(SeekFrom::Start(offset))
                    .map_err(|_| invalid(format!("seek to {} outside old entry", offset)))?;
                OpPhase::Next
            }
            other => return Err(invalid(format!("unknown operation {:#04x}", other))),
        };

        Ok(())
    }
}

impl<P: Read> Read for PatchReader<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.phase {
                OpPhase::Done => return Ok(0),
                OpPhase::Next | OpPhase::Data(0) | OpPhase::Copy(0) | OpPhase::Add(0) => self.next_op()?,
                OpPhase::Data(left) => {
                    let n = (buf.len() as u64).min(left) as usize;
                    self.read_patch(&mut buf[..n])?;
                    self.phase = OpPhase::Data(left - n as u64);
                    return Ok(n);
                }
                OpPhase::Copy(left) => {
                    let n = (buf.len() as u64).min(left).min(COPY_CHUNK as u64) as usize;
                    self.read_source(&mut buf[..n])?;
                    self.phase = OpPhase::Copy(left - n as u64);
                    return Ok(n);
                }
                OpPhase::Add(left) => {
                    let n = (buf.len() as u64).min(left).min(COPY_CHUNK as u64) as usize;
                    self.read_patch(&mut buf[..n])?;
                    let mut scratch = std::mem::take(&mut self.scratch);
                    scratch.resize(n, 0);
                    let result = self.read_source(&mut scratch);
                    for (byte, old) in buf[..n].iter_mut().zip(&scratch) {
                        *byte = byte.wrapping_add(*old);
                    }
                    self.scratch = scratch;
                    result?;
                    self.phase = OpPhase::Add(left - n as u64);
                    return Ok(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressorKind;
    use proptest::prelude::*;
    use std::fs::File;
    use std::io::Cursor;

    fn spool(mut reader: impl Read) -> io::Result<File> {
        let mut file = tempfile::tempfile()?;
        io::copy(&mut reader, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    enum Item<'a> {
        File(&'a str, Vec<u8>),
        Dir(&'a str),
    }

    fn build_tar(items: &[Item<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for item in items {
            let mut header = tar::Header::new_gnu();
            header.set_mtime(1_700_000_000);
            match item {
                Item::File(path, data) => {
                    header.set_size(data.len() as u64);
                    header.set_mode(0o644);
                    builder.append_data(&mut header, path, data.as_slice()).unwrap();
                }
                Item::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn diff(old: &[u8], new: &[u8]) -> Vec<u8> {
        let mut patch = Vec::new();
        TarDiff
            .diff(Box::new(Cursor::new(old.to_vec())), Box::new(Cursor::new(new.to_vec())))
            .unwrap()
            .read_to_end(&mut patch)
            .unwrap();
        patch
    }

    fn apply(old: &[u8], patch: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        TarDiff
            .patch(Box::new(Cursor::new(old.to_vec())), Box::new(Cursor::new(patch)))
            .map_err(|e| io::Error::other(e.to_string()))?
            .read_to_end(&mut out)?;
        Ok(out)
    }

    fn body(seed: u32, len: usize) -> Vec<u8> {
        (0..len as u32).map(|i| (i.wrapping_mul(seed).wrapping_add(seed) >> 7) as u8).collect()
    }

    #[test]
    fn test_roundtrip_with_changes() {
        let old = build_tar(&[
            Item::Dir("app"),
            Item::File("app/config.json", b"{\"version\": 1}".to_vec()),
            Item::File("app/binary", body(31, 100_000)),
            Item::File("app/removed.txt", b"going away".to_vec()),
        ]);

        let mut binary = body(31, 100_000);
        binary[500] = binary[500].wrapping_add(1);
        binary.extend_from_slice(b"appended");
        let new = build_tar(&[
            Item::Dir("app"),
            Item::File("app/config.json", b"{\"version\": 2}".to_vec()),
            Item::File("app/binary", binary),
            Item::File("app/added.txt", b"brand new".to_vec()),
            Item::File("app/empty", Vec::new()),
        ]);

        let patch = diff(&old, &new);
        assert_eq!(apply(&old, patch).unwrap(), new);
    }

    #[test]
    fn test_unchanged_files_become_copies() {
        let files: Vec<Item<'_>> = vec![
            Item::File("one", body(7, 200_000)),
            Item::File("two", body(13, 200_000)),
        ];
        let archive = build_tar(&files);
        let patch = diff(&archive, &archive);

        // Only headers, padding and the trailer are stored literally
        assert!(patch.len() < 8 * 1024, "patch is {} bytes", patch.len());
        assert_eq!(apply(&archive, patch).unwrap(), archive);
    }

    #[test]
    fn test_moved_content_is_not_matched_by_name() {
        let old = build_tar(&[Item::File("a", body(3, 10_000))]);
        let new = build_tar(&[Item::File("b", body(3, 10_000))]);
        let patch = diff(&old, &new);
        assert_eq!(apply(&old, patch).unwrap(), new);
    }

    #[test]
    fn test_long_names_roundtrip() {
        let long = format!("{}/leaf.txt", "deep".repeat(40));
        let old = build_tar(&[Item::File(&long, body(5, 4096))]);
        let mut changed = body(5, 4096);
        changed[0] = 0;
        let new = build_tar(&[Item::File(&long, changed)]);

        let patch = diff(&old, &new);
        assert!(patch.len() < new.len());
        assert_eq!(apply(&old, patch).unwrap(), new);
    }

    #[test]
    fn test_compressed_patch_roundtrip() {
        let old = build_tar(&[Item::File("data", body(11, 50_000))]);
        let mut changed = body(11, 50_000);
        changed.truncate(40_000);
        let new = build_tar(&[Item::File("data", changed)]);

        let codec = CompressorKind::Zstd.compressor();
        let patch = TarDiff
            .diff(Box::new(Cursor::new(old.clone())), Box::new(Cursor::new(new.clone())))
            .unwrap();
        let compressed = spool(codec.compress(patch).unwrap()).unwrap();

        let mut rebuilt = Vec::new();
        TarDiff
            .patch(Box::new(Cursor::new(old)), codec.decompress(Box::new(compressed)).unwrap())
            .unwrap()
            .read_to_end(&mut rebuilt)
            .unwrap();
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn test_patch_against_other_archive_fails() {
        let old = build_tar(&[Item::File("a", body(3, 1000))]);
        let new = build_tar(&[Item::File("a", body(4, 1000))]);
        let patch = diff(&old, &new);

        let unrelated = build_tar(&[Item::File("b", body(3, 1000))]);
        let err = apply(&unrelated, patch).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_new_archive_is_rejected() {
        let old = build_tar(&[Item::File("a", body(3, 1000))]);
        let mut new = build_tar(&[Item::File("a", body(4, 1000))]);
        new.truncate(700);

        let result = TarDiff.diff(Box::new(Cursor::new(old)), Box::new(Cursor::new(new)));
        assert!(matches!(result, Err(DiffError::InvalidArchive(_))));
    }

    #[test]
    fn test_rejects_foreign_patch() {
        let old = build_tar(&[Item::File("a", b"x".to_vec())]);
        let err = TarDiff
            .patch(Box::new(Cursor::new(old)), Box::new(Cursor::new(b"IMGBSD01........".to_vec())))
            .err()
            .unwrap();
        assert!(matches!(err, DiffError::InvalidPatch(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip(old_files in proptest::collection::vec((0usize..6, proptest::collection::vec(any::<u8>(), 0..3000)), 0..5),
                          new_files in proptest::collection::vec((0usize..6, proptest::collection::vec(any::<u8>(), 0..3000)), 0..5)) {
            let names = ["a", "b", "dir/c", "dir/d", "./e", "f.bin"];
            let to_items = |files: &[(usize, Vec<u8>)]| -> Vec<u8> {
                let items: Vec<Item<'_>> = files
                    .iter()
                    .map(|(name, data)| Item::File(names[*name], data.clone()))
                    .collect();
                build_tar(&items)
            };
            let old = to_items(&old_files);
            let new = to_items(&new_files);

            let patch = diff(&old, &new);
            prop_assert_eq!(apply(&old, patch).unwrap(), new);
        }
    }
}
