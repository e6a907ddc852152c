//! bsdiff-style binary differ.
//!
//! The patch is a header (`IMGBSD01`, new size as u64) followed by records of
//! `[add_len u64][extra_len u64][seek i64]`, `add_len` bytes to be added to the
//! old data and `extra_len` literal bytes. All integers are little endian.
//! The old cursor starts at 0, advances by `add_len` and then jumps by `seek`.

use std::io::{self, Cursor, Read};

use tracing::debug;

use super::{DiffError, Differ, Patcher, Result};
use crate::compression::ByteStream;

const MAGIC: &[u8; 8] = b"IMGBSD01";
const CONTROL_LEN: usize = 24;

/// A stretch of the new data: `add_len` bytes approximately matching old data
/// at `old_start`, followed by `extra_len` bytes with no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    pub old_start: usize,
    pub new_start: usize,
    pub add_len: usize,
    pub extra_len: usize,
}

/// Sort all suffixes of `data` by prefix doubling.
fn suffix_array(data: &[u8]) -> Vec<usize> {
    let n = data.len();
    let mut sa: Vec<usize> = (0..n).collect();
    if n < 2 {
        return sa;
    }

    let mut rank: Vec<usize> = data.iter().map(|&b| b as usize).collect();
    let mut next = vec![0usize; n];
    let mut k = 1;

    loop {
        let key = |rank: &[usize], i: usize| (rank[i], if i + k < n { rank[i + k] + 1 } else { 0 });

        sa.sort_unstable_by_key(|&i| key(&rank, i));

        next[sa[0]] = 0;
        for w in 1..n {
            let bump = usize::from(key(&rank, sa[w - 1]) < key(&rank, sa[w]));
            next[sa[w]] = next[sa[w - 1]] + bump;
        }
        std::mem::swap(&mut rank, &mut next);

        if rank[sa[n - 1]] == n - 1 || k >= n {
            break;
        }
        k *= 2;
    }

    sa
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Longest prefix of `target` found in `old`, as (position, length).
fn search(sa: &[usize], old: &[u8], target: &[u8]) -> (usize, usize) {
    if sa.is_empty() || target.is_empty() {
        return (0, 0);
    }

    let (mut st, mut en) = (0, sa.len() - 1);
    while en - st >= 2 {
        let mid = st + (en - st) / 2;
        let suffix = &old[sa[mid]..];
        let n = suffix.len().min(target.len());
        if suffix[..n] < target[..n] {
            st = mid;
        } else {
            en = mid;
        }
    }

    let x = match_len(&old[sa[st]..], target);
    let y = match_len(&old[sa[en]..], target);
    if x > y { (sa[st], x) } else { (sa[en], y) }
}

/// Split `new` into segments approximately matching `old`.
pub(crate) fn segments(old: &[u8], new: &[u8]) -> Vec<Segment> {
    let sa = suffix_array(old);
    let old_size = old.len() as isize;
    let new_size = new.len() as isize;
    let at_old = |i: isize| old[i as usize];
    let at_new = |i: isize| new[i as usize];

    let mut result = Vec::new();
    let (mut scan, mut len, mut pos) = (0isize, 0isize, 0isize);
    let (mut last_scan, mut last_pos, mut last_offset) = (0isize, 0isize, 0isize);

    while scan < new_size {
        let mut old_score = 0isize;
        scan += len;
        let mut scsc = scan;

        while scan < new_size {
            let (p, l) = search(&sa, old, &new[scan as usize..]);
            pos = p as isize;
            len = l as isize;

            while scsc < scan + len {
                let o = scsc + last_offset;
                if o >= 0 && o < old_size && at_old(o) == at_new(scsc) {
                    old_score += 1;
                }
                scsc += 1;
            }

            if (len == old_score && len != 0) || len > old_score + 8 {
                break;
            }

            let o = scan + last_offset;
            if o >= 0 && o < old_size && at_old(o) == at_new(scan) {
                old_score -= 1;
            }
            scan += 1;
        }

        if len != old_score || scan == new_size {
            // Extend the previous match forwards
            let (mut s, mut best, mut len_f) = (0isize, 0isize, 0isize);
            let mut i = 0isize;
            while last_scan + i < scan && last_pos + i < old_size {
                if at_old(last_pos + i) == at_new(last_scan + i) {
                    s += 1;
                }
                i += 1;
                if s * 2 - i > best * 2 - len_f {
                    best = s;
                    len_f = i;
                }
            }

            // Extend the current match backwards
            let mut len_b = 0isize;
            if scan < new_size {
                let (mut s, mut best) = (0isize, 0isize);
                let mut i = 1isize;
                while scan >= last_scan + i && pos >= i {
                    if at_old(pos - i) == at_new(scan - i) {
                        s += 1;
                    }
                    if s * 2 - i > best * 2 - len_b {
                        best = s;
                        len_b = i;
                    }
                    i += 1;
                }
            }

            // Resolve overlap between the two extensions
            if last_scan + len_f > scan - len_b {
                let overlap = (last_scan + len_f) - (scan - len_b);
                let (mut s, mut best, mut len_s) = (0isize, 0isize, 0isize);
                for i in 0..overlap {
                    if at_new(last_scan + len_f - overlap + i) == at_old(last_pos + len_f - overlap + i) {
                        s += 1;
                    }
                    if at_new(scan - len_b + i) == at_old(pos - len_b + i) {
                        s -= 1;
                    }
                    if s > best {
                        best = s;
                        len_s = i + 1;
                    }
                }
                len_f += len_s - overlap;
                len_b -= len_s;
            }

            result.push(Segment {
                old_start: last_pos as usize,
                new_start: last_scan as usize,
                add_len: len_f as usize,
                extra_len: ((scan - len_b) - (last_scan + len_f)) as usize,
            });

            last_scan = scan - len_b;
            last_pos = pos - len_b;
            last_offset = pos - scan;
        }
    }

    result
}

/// Encode `new` against `old` as a complete bsdiff patch.
pub fn encode(old: &[u8], new: &[u8]) -> Vec<u8> {
    let segments = segments(old, new);
    let mut patch = Vec::with_capacity(16 + new.len() / 4);
    patch.extend_from_slice(MAGIC);
    patch.extend_from_slice(&(new.len() as u64).to_le_bytes());

    for (index, segment) in segments.iter().enumerate() {
        let old_end = segment.old_start + segment.add_len;
        let seek = segments
            .get(index + 1)
            .map(|next| next.old_start as i64 - old_end as i64)
            .unwrap_or(0);

        patch.extend_from_slice(&(segment.add_len as u64).to_le_bytes());
        patch.extend_from_slice(&(segment.extra_len as u64).to_le_bytes());
        patch.extend_from_slice(&seek.to_le_bytes());

        let added = &new[segment.new_start..segment.new_start + segment.add_len];
        patch.extend(
            added
                .iter()
                .zip(&old[segment.old_start..old_end])
                .map(|(n, o)| n.wrapping_sub(*o)),
        );

        let extra_start = segment.new_start + segment.add_len;
        patch.extend_from_slice(&new[extra_start..extra_start + segment.extra_len]);
    }

    patch
}

/// Byte-level differ with no knowledge of the content structure.
pub struct BsDiff;

impl Differ for BsDiff {
    fn name(&self) -> &'static str {
        "bsdiff"
    }

    fn diff(&self, mut old: ByteStream, mut new: ByteStream) -> Result<ByteStream> {
        let mut old_data = Vec::new();
        old.read_to_end(&mut old_data)?;
        let mut new_data = Vec::new();
        new.read_to_end(&mut new_data)?;

        let patch = encode(&old_data, &new_data);
        debug!(
            "bsdiff: old {} bytes, new {} bytes, patch {} bytes",
            old_data.len(),
            new_data.len(),
            patch.len()
        );

        Ok(Box::new(Cursor::new(patch)))
    }
}

impl Patcher for BsDiff {
    fn name(&self) -> &'static str {
        "bsdiff"
    }

    fn patch(&self, mut old: ByteStream, mut patch: ByteStream) -> Result<ByteStream> {
        let mut header = [0u8; 16];
        patch.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DiffError::InvalidPatch("truncated header".to_string()),
            _ => DiffError::Io(e),
        })?;
        if &header[..8] != MAGIC {
            return Err(DiffError::InvalidPatch("bad magic".to_string()));
        }
        let new_size = le_u64(&header[8..]);

        let mut old_data = Vec::new();
        old.read_to_end(&mut old_data)?;

        Ok(Box::new(PatchReader {
            old: old_data,
            patch,
            old_pos: 0,
            remaining: new_size,
            phase: Phase::Control,
        }))
    }
}

enum Phase {
    Control,
    Add { left: u64, extra: u64, seek: i64 },
    Extra { left: u64, seek: i64 },
}

/// Yields the new data while consuming the patch.
struct PatchReader<R> {
    old: Vec<u8>,
    patch: R,
    old_pos: i64,
    remaining: u64,
    phase: Phase,
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid bsdiff patch: {}", message))
}

impl<R: Read> PatchReader<R> {
    fn read_patch(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.patch.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => invalid("truncated"),
            _ => e,
        })
    }
}

impl<R: Read> Read for PatchReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.remaining == 0 {
                return Ok(0);
            }

            match self.phase {
                Phase::Control => {
                    let mut control = [0u8; CONTROL_LEN];
                    self.read_patch(&mut control)?;
                    let add = le_u64(&control[0..8]);
                    let extra = le_u64(&control[8..16]);
                    let seek = le_u64(&control[16..24]) as i64;

                    if add.checked_add(extra).is_none_or(|total| total > self.remaining) {
                        return Err(invalid("control exceeds declared size"));
                    }
                    self.phase = Phase::Add { left: add, extra, seek };
                }
                Phase::Add { left: 0, extra, seek } => {
                    self.phase = Phase::Extra { left: extra, seek };
                }
                Phase::Add { left, extra, seek } => {
                    let n = (buf.len() as u64).min(left) as usize;
                    let start = self.old_pos;
                    if start < 0 || start as u64 + n as u64 > self.old.len() as u64 {
                        return Err(invalid("reference outside old data"));
                    }
                    self.read_patch(&mut buf[..n])?;
                    let source = &self.old[start as usize..start as usize + n];
                    for (byte, old) in buf[..n].iter_mut().zip(source) {
                        *byte = byte.wrapping_add(*old);
                    }
                    self.old_pos += n as i64;
                    self.remaining -= n as u64;
                    self.phase = Phase::Add { left: left - n as u64, extra, seek };
                    return Ok(n);
                }
                Phase::Extra { left: 0, seek } => {
                    self.old_pos += seek;
                    self.phase = Phase::Control;
                }
                Phase::Extra { left, seek } => {
                    let n = (buf.len() as u64).min(left) as usize;
                    self.read_patch(&mut buf[..n])?;
                    self.remaining -= n as u64;
                    self.phase = Phase::Extra { left: left - n as u64, seek };
                    return Ok(n);
                }
            }
        }
    }
}
