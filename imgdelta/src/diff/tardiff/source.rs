use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::archive::{self, BLOCK_SIZE, HeaderKind, PendingMeta};

const FILL_CHUNK: usize = 64 * 1024;

/// Byte range of an entry's data inside the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRange {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct CurrentFile {
    range: EntryRange,
    pos: u64,
}

/// Random access to the members of a tar archive that arrives as a
/// forward-only stream.
///
/// Headers are indexed as the stream is consumed and every consumed byte is
/// kept in a spool file, so entries already passed can be read again. The
/// spool only grows as far as the furthest byte requested so far.
///
/// Reads and seeks are confined to the entry selected with
/// [`TarSource::set_current_file`]: reading past its end yields end-of-data,
/// seeking outside `[0, size]` fails. When a name occurs more than once, the
/// first occurrence is used.
pub struct TarSource<R> {
    source: R,
    spool: File,
    spooled: u64,
    next_header: u64,
    finished: bool,
    pending: PendingMeta,
    index: HashMap<String, EntryRange>,
    current: Option<CurrentFile>,
}

impl<R: Read> TarSource<R> {
    /// Wrap a stream, spooling into an anonymous temporary file.
    pub fn new(source: R) -> io::Result<Self> {
        Ok(Self::with_spool(source, tempfile::tempfile()?))
    }

    /// Wrap a stream, spooling into the given file.
    pub fn with_spool(source: R, spool: File) -> Self {
        Self {
            source,
            spool,
            spooled: 0,
            next_header: 0,
            finished: false,
            pending: PendingMeta::default(),
            index: HashMap::new(),
            current: None,
        }
    }

    /// Select the entry subsequent reads and seeks refer to.
    ///
    /// Returns `false`, and clears the selection, when the archive has no
    /// regular file of that name.
    pub fn set_current_file(&mut self, name: &str) -> io::Result<bool> {
        let name = archive::normalize(name);

        loop {
            if let Some(range) = self.index.get(&name) {
                self.current = Some(CurrentFile { range: *range, pos: 0 });
                return Ok(true);
            }
            if !self.index_next()? {
                self.current = None;
                return Ok(false);
            }
        }
    }

    /// Size of the selected entry.
    pub fn current_size(&self) -> Option<u64> {
        self.current.map(|current| current.range.size)
    }

    /// Number of archive bytes copied to the spool so far.
    pub fn spooled_len(&self) -> u64 {
        self.spooled
    }

    /// Pull bytes from the stream into the spool until `end` is covered or
    /// the stream ends.
    fn fill_to(&mut self, end: u64) -> io::Result<()> {
        if self.spooled >= end {
            return Ok(());
        }

        self.spool.seek(SeekFrom::Start(self.spooled))?;
        let mut buf = vec![0u8; FILL_CHUNK];
        while self.spooled < end {
            let n = match self.source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.spool.write_all(&buf[..n])?;
            self.spooled += n as u64;
        }

        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset.saturating_add(buf.len() as u64);
        self.fill_to(end)?;
        if self.spooled < end {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tar archive truncated"));
        }

        self.spool.seek(SeekFrom::Start(offset))?;
        self.spool.read_exact(buf)
    }

    /// Index the next header. Returns `false` once the archive is exhausted.
    fn index_next(&mut self) -> io::Result<bool> {
        if self.finished {
            return Ok(false);
        }

        let offset = self.next_header;
        self.fill_to(offset.saturating_add(BLOCK_SIZE))?;
        if self.spooled <= offset {
            self.finished = true;
            return Ok(false);
        }

        let mut block = [0u8; BLOCK_SIZE as usize];
        self.read_at(offset, &mut block)?;

        let Some(info) = archive::parse_header(&block)? else {
            self.finished = true;
            return Ok(false);
        };

        let data_offset = offset.saturating_add(BLOCK_SIZE);

        match info.kind {
            HeaderKind::LongName | HeaderKind::Pax => {
                self.next_header = data_offset + archive::padded(info.size);
                let mut data = vec![0u8; info.size as usize];
                self.read_at(data_offset, &mut data)?;
                self.pending.absorb(info.kind, &data);
            }
            HeaderKind::File => {
                let info = self.pending.resolve(info);
                self.next_header = data_offset.saturating_add(archive::padded(info.size));
                self.index.entry(archive::normalize(&info.path)).or_insert(EntryRange {
                    offset: data_offset,
                    size: info.size,
                });
            }
            HeaderKind::Other => {
                let info = self.pending.resolve(info);
                self.next_header = data_offset.saturating_add(archive::padded(info.size));
            }
        }

        Ok(true)
    }
}

impl<R: Read> Read for TarSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(current) = self.current else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no current file selected"));
        };

        let left = current.range.size - current.pos;
        let n = (buf.len() as u64).min(left) as usize;
        if n == 0 {
            return Ok(0);
        }

        self.read_at(current.range.offset + current.pos, &mut buf[..n])?;
        self.current = Some(CurrentFile {
            pos: current.pos + n as u64,
            ..current
        });

        Ok(n)
    }
}

impl<R: Read> Seek for TarSource<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let Some(current) = self.current else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no current file selected"));
        };

        let size = current.range.size as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => current.pos as i128 + delta as i128,
            SeekFrom::End(delta) => size + delta as i128,
        };

        if target < 0 || target > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {} outside entry of {} bytes", target, size),
            ));
        }

        self.current = Some(CurrentFile {
            pos: target as u64,
            ..current
        });
        Ok(target as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_tar(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            builder.append_data(&mut header, path, data.as_slice()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Hands out at most a few bytes per read, like a network stream.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(7);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_reads_entries_in_any_order() {
        let archive = build_tar(&[
            ("a.txt", b"alpha".to_vec()),
            ("dir/b.txt", b"bravo bravo".to_vec()),
            ("c.bin", vec![3u8; 2000]),
        ]);
        let mut source = TarSource::new(Trickle(Cursor::new(archive))).unwrap();

        let mut content = Vec::new();
        assert!(source.set_current_file("c.bin").unwrap());
        source.read_to_end(&mut content).unwrap();
        assert_eq!(content, vec![3u8; 2000]);

        content.clear();
        assert!(source.set_current_file("./a.txt").unwrap());
        source.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"alpha");

        content.clear();
        assert!(source.set_current_file("dir/b.txt").unwrap());
        assert_eq!(source.current_size(), Some(11));
        source.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"bravo bravo");
    }

    #[test]
    fn test_missing_entry() {
        let archive = build_tar(&[("a.txt", b"alpha".to_vec())]);
        let mut source = TarSource::new(Cursor::new(archive)).unwrap();

        assert!(!source.set_current_file("nope").unwrap());
        assert_eq!(source.current_size(), None);
        assert!(source.read(&mut [0u8; 4]).is_err());

        // The index is complete after a miss, lookups still succeed
        assert!(source.set_current_file("a.txt").unwrap());
    }

    #[test]
    fn test_read_past_end_is_end_of_data() {
        let archive = build_tar(&[("a.txt", b"alpha".to_vec()), ("b.txt", b"bravo".to_vec())]);
        let mut source = TarSource::new(Cursor::new(archive)).unwrap();
        assert!(source.set_current_file("a.txt").unwrap());

        let mut buf = [0u8; 64];
        assert_eq!(source.read(&mut buf).unwrap(), 5);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_seek_bounds() {
        let archive = build_tar(&[("a.txt", b"0123456789".to_vec())]);
        let mut source = TarSource::new(Cursor::new(archive)).unwrap();
        assert!(source.set_current_file("a.txt").unwrap());

        assert_eq!(source.seek(SeekFrom::Start(4)).unwrap(), 4);
        let mut buf = [0u8; 3];
        source.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"456");

        assert_eq!(source.seek(SeekFrom::Current(-2)).unwrap(), 5);
        assert_eq!(source.seek(SeekFrom::End(0)).unwrap(), 10);
        assert_eq!(source.read(&mut buf).unwrap(), 0);

        assert!(source.seek(SeekFrom::Start(11)).is_err());
        assert!(source.seek(SeekFrom::Current(-11)).is_err());
        assert!(source.seek(SeekFrom::End(1)).is_err());
    }

    #[test]
    fn test_spool_grows_on_demand() {
        let archive = build_tar(&[
            ("small.txt", b"tiny".to_vec()),
            ("big.bin", vec![9u8; 512 * 1024]),
        ]);
        let total = archive.len() as u64;
        let mut source = TarSource::new(Cursor::new(archive)).unwrap();

        assert!(source.set_current_file("small.txt").unwrap());
        assert!(source.spooled_len() < total / 2);

        assert!(source.set_current_file("big.bin").unwrap());
        source.seek(SeekFrom::End(-1)).unwrap();
        let mut last = [0u8; 1];
        source.read_exact(&mut last).unwrap();
        assert_eq!(last[0], 9);
    }

    #[test]
    fn test_long_names_are_indexed() {
        let long = format!("{}/file.txt", "nested".repeat(30));
        let archive = build_tar(&[(long.as_str(), b"deep".to_vec())]);
        let mut source = TarSource::new(Cursor::new(archive)).unwrap();

        assert!(source.set_current_file(&long).unwrap());
        let mut content = String::new();
        source.read_to_string(&mut content).unwrap();
        assert_eq!(content, "deep");
    }

    #[test]
    fn test_oversized_long_name_is_an_error() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("././@LongLink").unwrap();
        header.set_entry_type(tar::EntryType::GNULongName);
        header.set_size(1 << 60);
        header.set_cksum();
        builder.append(&header, &b"name"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let mut source = TarSource::new(Cursor::new(archive)).unwrap();
        let err = source.set_current_file("anything").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_pax_size_overrides_header_size() {
        let mut builder = tar::Builder::new(Vec::new());
        let records = b"10 size=5\n";
        let mut pax = tar::Header::new_ustar();
        pax.set_path("PaxHeaders/big.img").unwrap();
        pax.set_entry_type(tar::EntryType::XHeader);
        pax.set_size(records.len() as u64);
        pax.set_cksum();
        builder.append(&pax, &records[..]).unwrap();

        let mut file = tar::Header::new_ustar();
        file.set_path("big.img").unwrap();
        file.set_entry_type(tar::EntryType::Regular);
        file.set_size(0);
        file.set_cksum();
        builder.append(&file, &b"hello"[..]).unwrap();

        let mut after = tar::Header::new_ustar();
        after.set_path("after.txt").unwrap();
        after.set_entry_type(tar::EntryType::Regular);
        after.set_size(3);
        after.set_cksum();
        builder.append(&after, &b"end"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let mut source = TarSource::new(Cursor::new(archive)).unwrap();
        assert!(source.set_current_file("big.img").unwrap());
        let mut content = String::new();
        source.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        assert!(source.set_current_file("after.txt").unwrap());
        content.clear();
        source.read_to_string(&mut content).unwrap();
        assert_eq!(content, "end");
    }
}
