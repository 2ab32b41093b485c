//! Sparse map stream (spec.md §4.G).
//!
//! Grounded on `original_source/src/aff4_map.h`'s `AFF4Map` (`Range`,
//! `AddRange`, `targets`/`target_idx_map`). The original keys its range
//! table by range *end* to emulate `std::map::upper_bound`; this keys by
//! range *start* instead and uses [`std::collections::BTreeMap::range`]
//! directly, which gives the same "find the range covering offset X"
//! query with less bookkeeping — a deliberate idiomatic substitution
//! recorded in DESIGN.md, not a behavior change.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;
use std::cell::RefCell;

use crate::error::{Aff4Error, Aff4Result};
use crate::stream::{clamp_seek, Aff4Stream, StreamProperties};
use crate::urn::Urn;
use crate::volume::{SymbolicStream, SymbolicStreamReader};

/// A 4 KiB window is re-read on its own once a bulk read over a target
/// stream fails, so a single bad sector only poisons 4 KiB of output
/// instead of the whole requested read (spec.md §4.G).
const REREAD_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub map_offset: u64,
    pub target_offset: u64,
    pub length: u64,
    pub target_idx: u32,
}

impl Range {
    fn end(&self) -> u64 {
        self.map_offset + self.length
    }
}

const RECORD_LEN: usize = 28;

fn encode_ranges(ranges: &[Range]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ranges.len() * RECORD_LEN);
    for r in ranges {
        out.extend_from_slice(&r.map_offset.to_le_bytes());
        out.extend_from_slice(&r.length.to_le_bytes());
        out.extend_from_slice(&r.target_offset.to_le_bytes());
        out.extend_from_slice(&r.target_idx.to_le_bytes());
    }
    out
}

fn decode_ranges(buf: &[u8]) -> Vec<Range> {
    buf.chunks_exact(RECORD_LEN)
        .map(|c| Range {
            map_offset: u64::from_le_bytes(c[0..8].try_into().unwrap()),
            length: u64::from_le_bytes(c[8..16].try_into().unwrap()),
            target_offset: u64::from_le_bytes(c[16..24].try_into().unwrap()),
            target_idx: u32::from_le_bytes(c[24..28].try_into().unwrap()),
        })
        .collect()
}

fn encode_targets(targets: &[Urn]) -> Vec<u8> {
    targets
        .iter()
        .map(|u| u.as_str())
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}

fn decode_targets(buf: &[u8]) -> Vec<Urn> {
    String::from_utf8_lossy(buf)
        .lines()
        .filter(|l| !l.is_empty())
        .map(Urn::new)
        .collect()
}

/// A sparse stream expressed as a table of `(logical offset) -> (target
/// stream, target offset, length)` ranges, with implicit zero-fill for
/// any offset not covered by a range.
pub struct MapStream {
    urn: Urn,
    targets: Vec<Urn>,
    target_idx_map: HashMap<Urn, u32>,
    target_streams: HashMap<u32, Rc<RefCell<dyn Aff4Stream>>>,
    map: BTreeMap<u64, Range>,
    size: u64,
    pos: u64,
    /// Target index new writes append to; set via [`MapStream::set_write_target`].
    write_target_idx: Option<u32>,
}

impl MapStream {
    pub fn new(urn: Urn) -> Self {
        Self {
            urn,
            targets: Vec::new(),
            target_idx_map: HashMap::new(),
            target_streams: HashMap::new(),
            map: BTreeMap::new(),
            size: 0,
            pos: 0,
            write_target_idx: None,
        }
    }

    pub fn open(
        urn: Urn,
        map_bytes: &[u8],
        idx_bytes: &[u8],
        size: u64,
    ) -> Self {
        let targets = decode_targets(idx_bytes);
        let target_idx_map = targets
            .iter()
            .enumerate()
            .map(|(i, u)| (u.clone(), i as u32))
            .collect();
        let ranges = decode_ranges(map_bytes);
        let mut map = BTreeMap::new();
        for r in ranges {
            map.insert(r.map_offset, r);
        }
        Self {
            urn,
            targets,
            target_idx_map,
            target_streams: HashMap::new(),
            map,
            size,
            pos: 0,
            write_target_idx: None,
        }
    }

    /// Registers (or looks up) a target URN, returning its stable index.
    pub fn add_target(&mut self, urn: Urn) -> u32 {
        if let Some(idx) = self.target_idx_map.get(&urn) {
            return *idx;
        }
        let idx = self.targets.len() as u32;
        self.targets.push(urn.clone());
        self.target_idx_map.insert(urn, idx);
        idx
    }

    /// Binds an open stream handle to a target index, so reads through
    /// ranges referencing it can actually pull bytes.
    pub fn bind_target_stream(&mut self, idx: u32, stream: Rc<RefCell<dyn Aff4Stream>>) {
        self.target_streams.insert(idx, stream);
    }

    /// New writes append sequentially into this target.
    pub fn set_write_target(&mut self, idx: u32) {
        self.write_target_idx = Some(idx);
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn targets(&self) -> &[Urn] {
        &self.targets
    }

    pub fn serialize_map(&self) -> Vec<u8> {
        let ranges: Vec<Range> = self.map.values().copied().collect();
        encode_ranges(&ranges)
    }

    pub fn serialize_idx(&self) -> Vec<u8> {
        encode_targets(&self.targets)
    }

    pub fn size_hint(&self) -> u64 {
        self.size
    }

    /// Inserts `[map_offset, map_offset+length)` mapped to
    /// `target[target_offset..]`, clipping or splitting any existing
    /// ranges it overlaps, then merging with an adjacent same-target
    /// contiguous neighbor on either side.
    pub fn add_range(
        &mut self,
        map_offset: u64,
        target_offset: u64,
        length: u64,
        target_idx: u32,
    ) -> Aff4Result<()> {
        if length == 0 {
            return Ok(());
        }
        let new_end = map_offset + length;
        self.clip_overlaps(map_offset, new_end);

        let mut merged = Range {
            map_offset,
            target_offset,
            length,
            target_idx,
        };

        // Merge with the range immediately to the left, if contiguous.
        if let Some((&prev_key, prev)) = self.map.range(..map_offset).next_back() {
            if prev.target_idx == target_idx
                && prev.end() == merged.map_offset
                && prev.target_offset + prev.length == merged.target_offset
            {
                merged.map_offset = prev.map_offset;
                merged.target_offset = prev.target_offset;
                merged.length += prev.length;
                self.map.remove(&prev_key);
            }
        }

        // Merge with the range immediately to the right, if contiguous.
        if let Some(next) = self.map.get(&merged.end()).copied() {
            if next.target_idx == target_idx
                && merged.target_offset + merged.length == next.target_offset
            {
                merged.length += next.length;
                self.map.remove(&next.map_offset);
            }
        }

        self.size = std::cmp::max(self.size, merged.end());
        self.map.insert(merged.map_offset, merged);
        Ok(())
    }

    /// Removes or truncates any existing ranges overlapping `[start, end)`.
    fn clip_overlaps(&mut self, start: u64, end: u64) {
        let mut to_remove = Vec::new();
        let mut to_insert = Vec::new();

        // A range starting before `start` may still extend into the hole.
        if let Some((&key, r)) = self.map.range(..start).next_back() {
            if r.end() > start {
                let mut left = *r;
                if left.end() > end {
                    // Fully straddles the new range: split into left + right remainders.
                    let right = Range {
                        map_offset: end,
                        target_offset: r.target_offset + (end - r.map_offset),
                        length: r.end() - end,
                        target_idx: r.target_idx,
                    };
                    to_insert.push(right);
                }
                left.length = start - left.map_offset;
                to_remove.push(key);
                if left.length > 0 {
                    to_insert.push(left);
                }
            }
        }

        let overlapping: Vec<u64> = self
            .map
            .range(start..end)
            .map(|(&k, _)| k)
            .collect();
        for key in overlapping {
            let r = self.map[&key];
            to_remove.push(key);
            if r.end() > end {
                let shift = end - r.map_offset;
                let right = Range {
                    map_offset: end,
                    target_offset: r.target_offset + shift,
                    length: r.end() - end,
                    target_idx: r.target_idx,
                };
                to_insert.push(right);
            }
        }

        for key in to_remove {
            self.map.remove(&key);
        }
        for r in to_insert {
            self.map.insert(r.map_offset, r);
        }
    }

    fn range_covering(&self, offset: u64) -> Option<Range> {
        self.map
            .range(..=offset)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| offset < r.end())
    }

    fn read_from_target(
        &mut self,
        target_idx: u32,
        target_offset: u64,
        buf: &mut [u8],
    ) -> Aff4Result<()> {
        if let Some(target_urn) = self.targets.get(target_idx as usize) {
            if let Some(symbolic) = SymbolicStream::from_urn(target_urn) {
                let mut reader = SymbolicStreamReader::new(symbolic);
                reader.seek(SeekFrom::Start(target_offset))?;
                reader.read_exact(buf)?;
                return Ok(());
            }
        }
        let stream = self
            .target_streams
            .get(&target_idx)
            .ok_or_else(|| Aff4Error::NotFound(format!("unbound map target index {target_idx}")))?
            .clone();
        let mut stream = stream.borrow_mut();
        stream.seek(SeekFrom::Start(target_offset))?;

        match stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Re-read in 4 KiB windows so one bad region doesn't blank
                // out the rest of an otherwise-readable range.
                let mut done = 0usize;
                for chunk in buf.chunks_mut(REREAD_WINDOW) {
                    let chunk_offset = target_offset + done as u64;
                    stream.seek(SeekFrom::Start(chunk_offset))?;
                    if stream.read_exact(chunk).is_err() {
                        SymbolicStream::UnreadableData.fill(chunk, chunk_offset);
                    }
                    done += chunk.len();
                }
                Ok(())
            }
        }
    }
}

impl Read for MapStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let want = std::cmp::min(buf.len() as u64, self.size - self.pos) as usize;
        let mut filled = 0usize;
        while filled < want {
            let offset = self.pos + filled as u64;
            match self.range_covering(offset) {
                None => {
                    // Gap: zero-fill up to the next range's start (or EOF).
                    let next_start = self
                        .map
                        .range(offset..)
                        .next()
                        .map(|(&k, _)| k)
                        .unwrap_or(self.size);
                    let gap_len = std::cmp::min((next_start - offset) as usize, want - filled);
                    buf[filled..filled + gap_len].fill(0);
                    filled += gap_len;
                }
                Some(range) => {
                    let within = offset - range.map_offset;
                    let avail = (range.length - within) as usize;
                    let take = std::cmp::min(avail, want - filled);
                    self.read_from_target(
                        range.target_idx,
                        range.target_offset + within,
                        &mut buf[filled..filled + take],
                    )
                    .map_err(io::Error::from)?;
                    filled += take;
                }
            }
        }
        self.pos += filled as u64;
        Ok(filled)
    }
}

impl Write for MapStream {
    /// Appends `buf` to whichever target [`MapStream::set_write_target`]
    /// selected, mapping it at the map's current end — a map is never
    /// overwritten in place, only extended.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let target_idx = self.write_target_idx.ok_or_else(|| {
            crate::stream::invalid_input("map stream has no write target configured")
        })?;
        let stream = self
            .target_streams
            .get(&target_idx)
            .ok_or_else(|| crate::stream::invalid_input("write target is not bound"))?
            .clone();
        let target_offset = {
            let mut stream = stream.borrow_mut();
            let offset = stream.size().map_err(io::Error::from)?;
            stream.seek(SeekFrom::Start(offset))?;
            stream.write_all(buf)?;
            offset
        };
        let map_offset = self.size;
        self.add_range(map_offset, target_offset, buf.len() as u64, target_idx)
            .map_err(io::Error::from)?;
        self.pos = self.size;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(idx) = self.write_target_idx {
            if let Some(stream) = self.target_streams.get(&idx) {
                stream.borrow_mut().flush()?;
            }
        }
        Ok(())
    }
}

impl Seek for MapStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => self.pos as i64 + o,
            SeekFrom::End(o) => self.size as i64 + o,
        };
        self.pos = clamp_seek(target);
        Ok(self.pos)
    }
}

impl Aff4Stream for MapStream {
    fn properties(&self) -> StreamProperties {
        StreamProperties {
            seekable: true,
            sizeable: true,
            writable: self.write_target_idx.is_some(),
        }
    }

    fn size(&self) -> Aff4Result<u64> {
        Ok(self.size)
    }

    fn truncate(&mut self) -> Aff4Result<()> {
        self.map.clear();
        self.size = 0;
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct MemStream(Cursor<Vec<u8>>);
    impl Read for MemStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }
    impl Write for MemStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let pos = self.0.position();
            if pos as usize + buf.len() > self.0.get_ref().len() {
                self.0.get_mut().resize(pos as usize + buf.len(), 0);
            }
            self.0.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Seek for MemStream {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.seek(pos)
        }
    }
    impl Aff4Stream for MemStream {
        fn properties(&self) -> StreamProperties {
            StreamProperties {
                seekable: true,
                sizeable: true,
                writable: true,
            }
        }
        fn size(&self) -> Aff4Result<u64> {
            Ok(self.0.get_ref().len() as u64)
        }
        fn truncate(&mut self) -> Aff4Result<()> {
            self.0.get_mut().clear();
            self.0.set_position(0);
            Ok(())
        }
    }

    fn mem_stream() -> Rc<RefCell<dyn Aff4Stream>> {
        Rc::new(RefCell::new(MemStream(Cursor::new(Vec::new()))))
    }

    #[test]
    fn gaps_read_as_zero() {
        let mut map = MapStream::new(Urn::new("aff4://map1"));
        let backing = mem_stream();
        let idx = map.add_target(Urn::new("aff4://backing"));
        map.bind_target_stream(idx, backing);
        map.add_range(100, 0, 10, idx).unwrap();
        map.size = 200;

        let mut buf = vec![0xAAu8; 50];
        map.seek(SeekFrom::Start(0)).unwrap();
        map.read_exact(&mut buf).unwrap();
        assert!(buf[..100.min(50)].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_appends_and_reads_back() {
        let mut map = MapStream::new(Urn::new("aff4://map2"));
        let backing = mem_stream();
        let idx = map.add_target(Urn::new("aff4://backing"));
        map.bind_target_stream(idx, backing);
        map.set_write_target(idx);

        map.write_all(b"hello").unwrap();
        map.write_all(b" world").unwrap();
        assert_eq!(map.size_hint(), 11);

        map.seek(SeekFrom::Start(0)).unwrap();
        let mut out = vec![0u8; 11];
        map.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn add_range_splits_existing_overlap() {
        let mut map = MapStream::new(Urn::new("aff4://map3"));
        let backing = mem_stream();
        let idx = map.add_target(Urn::new("aff4://backing"));
        map.bind_target_stream(idx, backing);

        map.add_range(0, 0, 100, idx).unwrap();
        map.add_range(40, 1000, 10, idx).unwrap();

        let ranges: Vec<Range> = map.map.values().copied().collect();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].map_offset, 0);
        assert_eq!(ranges[0].length, 40);
        assert_eq!(ranges[1].map_offset, 40);
        assert_eq!(ranges[1].length, 10);
        assert_eq!(ranges[1].target_offset, 1000);
        assert_eq!(ranges[2].map_offset, 50);
        assert_eq!(ranges[2].length, 50);
        assert_eq!(ranges[2].target_offset, 50);
    }

    #[test]
    fn add_range_merges_contiguous_same_target() {
        let mut map = MapStream::new(Urn::new("aff4://map4"));
        let backing = mem_stream();
        let idx = map.add_target(Urn::new("aff4://backing"));
        map.bind_target_stream(idx, backing);

        map.add_range(0, 0, 50, idx).unwrap();
        map.add_range(50, 50, 50, idx).unwrap();

        let ranges: Vec<Range> = map.map.values().copied().collect();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].length, 100);
    }

    #[test]
    fn map_serialization_round_trips() {
        let mut map = MapStream::new(Urn::new("aff4://map5"));
        let backing = mem_stream();
        let idx = map.add_target(Urn::new("aff4://backing"));
        map.bind_target_stream(idx, backing);
        map.add_range(0, 0, 10, idx).unwrap();
        map.add_range(20, 10, 10, idx).unwrap();
        map.size = 30;

        let map_bytes = map.serialize_map();
        let idx_bytes = map.serialize_idx();

        let reopened = MapStream::open(Urn::new("aff4://map5"), &map_bytes, &idx_bytes, 30);
        assert_eq!(reopened.targets(), &[Urn::new("aff4://backing")]);
        assert_eq!(reopened.map.len(), 2);
    }

    #[test]
    fn range_record_matches_spec_field_order() {
        // map_offset, length, target_offset, target_id — spec.md §3/§6 and
        // original_source/src/aff4_map.h, not the encode/decode call order.
        let range = Range {
            map_offset: 0x1111_1111_1111_1111,
            target_offset: 0x3333_3333_3333_3333,
            length: 0x2222_2222_2222_2222,
            target_idx: 0x4444_4444,
        };
        let encoded = encode_ranges(&[range]);
        assert_eq!(&encoded[0..8], &0x1111_1111_1111_1111u64.to_le_bytes());
        assert_eq!(&encoded[8..16], &0x2222_2222_2222_2222u64.to_le_bytes());
        assert_eq!(&encoded[16..24], &0x3333_3333_3333_3333u64.to_le_bytes());
        assert_eq!(&encoded[24..28], &0x4444_4444u32.to_le_bytes());

        let decoded = decode_ranges(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].map_offset, range.map_offset);
        assert_eq!(decoded[0].length, range.length);
        assert_eq!(decoded[0].target_offset, range.target_offset);
        assert_eq!(decoded[0].target_idx, range.target_idx);
    }
}
