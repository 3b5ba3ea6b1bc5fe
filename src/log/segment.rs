use super::{Entry, Index};
use crate::encoding;
use crate::errcorrupt;
use crate::error::Result;

use ::log::warn;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

/// Length of the fixed segment header: entry_start, entry_end, and body_end,
/// each a big-endian u64.
pub const HEADER_LEN: u64 = 24;

/// Fixed per-record overhead: the entry id (u64), the payload length (i32),
/// and the trailing record length (i32). The trailing length word lets
/// truncation scan the body in reverse.
const RECORD_OVERHEAD: u64 = 16;

/// A segment file header, rewritten in place after each append batch.
/// entry_end < entry_start means the segment is empty.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    /// The first entry index in the segment.
    pub entry_start: Index,
    /// The last entry index in the segment.
    pub entry_end: Index,
    /// The file offset one past the last record.
    pub body_end: u64,
}

/// A single self-describing log segment: a header followed by a body of
/// framed entry records. Records are laid out as
/// `entry_id u64 | payload_len i32 | payload | record_len i32` (big-endian),
/// where the payload is the Bincode encoding of the entry.
pub struct Segment {
    /// The segment file number, also encoded in the file name.
    pub file_num: u64,
    file: File,
    pub header: Header,
    /// Record offsets by entry index. Built eagerly for the active segment
    /// (its body is scanned at recovery anyway), lazily on first read for
    /// sealed segments.
    offsets: Option<BTreeMap<Index, u64>>,
}

/// Returns the file name for a segment number, e.g. 0000000001.log.
pub fn file_name(file_num: u64) -> String {
    format!("{file_num:010}.log")
}

/// Parses a segment file name into its number.
pub fn parse_file_name(name: &str) -> Option<u64> {
    let num = name.strip_suffix(".log")?;
    if num.len() != 10 {
        return None;
    }
    num.parse().ok()
}

impl Segment {
    /// Creates a new, empty segment starting at the given entry index.
    pub fn create(dir: &Path, file_num: u64, entry_start: Index) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join(file_name(file_num)))?;
        let header = Header { entry_start, entry_end: entry_start - 1, body_end: HEADER_LEN };
        let mut segment = Self { file_num, file, header, offsets: Some(BTreeMap::new()) };
        segment.write_header()?;
        segment.file.sync_all()?;
        Ok(segment)
    }

    /// Opens an existing segment. The active segment gets a full body scan:
    /// a torn suffix (e.g. from a crash mid-append) is discarded and the
    /// header rewritten to match the surviving records. Sealed segments only
    /// have their header read; their bodies are indexed lazily.
    pub fn open(dir: &Path, file_num: u64, active: bool) -> Result<Self> {
        let path = dir.join(file_name(file_num));
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = Self::read_header(&mut file, &path)?;
        let mut segment = Self { file_num, file, header, offsets: None };
        if active {
            segment.recover()?;
        }
        Ok(segment)
    }

    fn read_header(file: &mut File, path: &Path) -> Result<Header> {
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return errcorrupt!("segment {} is {len} bytes, smaller than its header", path.display());
        }
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut buf)?;
        let word = |i: usize| u64::from_be_bytes(buf[i * 8..(i + 1) * 8].try_into().unwrap());
        let header = Header { entry_start: word(0), entry_end: word(1), body_end: word(2) };
        if header.entry_start == 0 || header.entry_end < header.entry_start - 1 {
            return errcorrupt!(
                "segment {} has invalid index range {}..{}",
                path.display(),
                header.entry_start,
                header.entry_end
            );
        }
        Ok(header)
    }

    /// Writes the in-memory header back to the start of the file.
    pub fn write_header(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(&self.header.entry_start.to_be_bytes());
        buf[8..16].copy_from_slice(&self.header.entry_end.to_be_bytes());
        buf[16..24].copy_from_slice(&self.header.body_end.to_be_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Recovers the active segment by recomputing the body from a full
    /// forward scan, accepting every structurally valid record with a
    /// contiguous entry id. If the scan disagrees with the header (a torn
    /// append, or records written before the header made it out), the torn
    /// suffix is discarded and the header rewritten.
    fn recover(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut offsets = BTreeMap::new();
        let mut offset = HEADER_LEN;
        let mut entry_end = self.header.entry_start - 1;
        while offset < file_len {
            match self.read_record(offset) {
                Ok((entry, record_len)) if entry.index == entry_end + 1 => {
                    offsets.insert(entry.index, offset);
                    offset += record_len;
                    entry_end = entry.index;
                }
                _ => break, // torn or trailing garbage
            }
        }

        if (entry_end, offset) != (self.header.entry_end, self.header.body_end) {
            warn!(
                "segment {} header said {}@{}, scan found {entry_end}@{offset}; repairing",
                self.file_num, self.header.entry_end, self.header.body_end
            );
        }
        self.header.entry_end = entry_end;
        self.header.body_end = offset;
        self.write_header()?;
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        self.offsets = Some(offsets);
        Ok(())
    }

    /// Appends an entry to the body and updates the in-memory header. The
    /// caller is responsible for writing the header once per batch.
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        assert_eq!(entry.index, self.header.entry_end + 1, "segment append index gap");
        let payload = encoding::serialize(entry)?;
        assert!(payload.len() as u64 <= i32::MAX as u64, "entry payload too large");
        let record_len = RECORD_OVERHEAD + payload.len() as u64;

        let mut buf = Vec::with_capacity(record_len as usize);
        buf.extend_from_slice(&entry.index.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&(record_len as i32).to_be_bytes());

        self.file.seek(SeekFrom::Start(self.header.body_end))?;
        self.file.write_all(&buf)?;

        if let Some(offsets) = &mut self.offsets {
            offsets.insert(entry.index, self.header.body_end);
        }
        self.header.entry_end = entry.index;
        self.header.body_end += record_len;
        Ok(())
    }

    /// Fetches the entry at the given index, or None if it is outside the
    /// segment's range.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        if index < self.header.entry_start || index > self.header.entry_end {
            return Ok(None);
        }
        if self.offsets.is_none() {
            self.build_offsets()?;
        }
        let offset = *self.offsets.as_ref().unwrap().get(&index).unwrap();
        let (entry, _) = self.read_record(offset)?;
        if entry.index != index {
            return errcorrupt!(
                "segment {} record at offset {offset} has id {}, expected {index}",
                self.file_num,
                entry.index
            );
        }
        Ok(Some(entry))
    }

    /// Builds the record offset index with a forward body scan. Unlike the
    /// active-segment recovery scan, a sealed segment's body must match its
    /// header exactly.
    fn build_offsets(&mut self) -> Result<()> {
        let mut offsets = BTreeMap::new();
        let mut offset = HEADER_LEN;
        let mut next = self.header.entry_start;
        while offset < self.header.body_end {
            let (entry, record_len) = self.read_record(offset)?;
            if entry.index != next {
                return errcorrupt!(
                    "segment {} has id {} at offset {offset}, expected {next}",
                    self.file_num,
                    entry.index
                );
            }
            offsets.insert(entry.index, offset);
            offset += record_len;
            next += 1;
        }
        if next != self.header.entry_end + 1 || offset != self.header.body_end {
            return errcorrupt!(
                "segment {} body ends at {}@{offset}, header says {}@{}",
                self.file_num,
                next - 1,
                self.header.entry_end,
                self.header.body_end
            );
        }
        self.offsets = Some(offsets);
        Ok(())
    }

    /// Reads and decodes the record starting at the given offset, returning
    /// the entry and the total record length.
    fn read_record(&mut self, offset: u64) -> Result<(Entry, u64)> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut head = [0u8; 12];
        self.file.read_exact(&mut head)?;
        let entry_id = u64::from_be_bytes(head[0..8].try_into().unwrap());
        let payload_len = i32::from_be_bytes(head[8..12].try_into().unwrap());
        if payload_len < 0 {
            return errcorrupt!(
                "segment {} record at offset {offset} has invalid length header 0x{}",
                self.file_num,
                hex::encode(head)
            );
        }
        let mut payload = vec![0u8; payload_len as usize];
        self.file.read_exact(&mut payload)?;
        let mut tail = [0u8; 4];
        self.file.read_exact(&mut tail)?;
        let record_len = RECORD_OVERHEAD + payload_len as u64;
        if i32::from_be_bytes(tail) as i64 != record_len as i64 {
            return errcorrupt!(
                "segment {} record at offset {offset} has mismatched length word 0x{}",
                self.file_num,
                hex::encode(tail)
            );
        }
        let entry: Entry = encoding::deserialize(&payload)?;
        if entry.index != entry_id {
            return errcorrupt!(
                "segment {} record at offset {offset} has id {entry_id} but payload index {}",
                self.file_num,
                entry.index
            );
        }
        Ok((entry, record_len))
    }

    /// Truncates the segment so that the given index is the last one kept,
    /// scanning the body in reverse via the trailing record length words.
    /// The index must be within [entry_start - 1, entry_end]; entry_start - 1
    /// empties the segment.
    pub fn truncate(&mut self, index: Index) -> Result<()> {
        assert!(
            index + 1 >= self.header.entry_start && index <= self.header.entry_end,
            "truncate index {index} outside segment range"
        );
        let mut offset = self.header.body_end;
        let mut end = self.header.entry_end;
        while end > index {
            self.file.seek(SeekFrom::Start(offset - 4))?;
            let mut tail = [0u8; 4];
            self.file.read_exact(&mut tail)?;
            let record_len = i32::from_be_bytes(tail) as i64;
            if record_len < RECORD_OVERHEAD as i64 || (record_len as u64) > offset - HEADER_LEN {
                return errcorrupt!(
                    "segment {} has invalid trailing length word at offset {offset}",
                    self.file_num
                );
            }
            offset -= record_len as u64;
            self.file.seek(SeekFrom::Start(offset))?;
            let mut id = [0u8; 8];
            self.file.read_exact(&mut id)?;
            if u64::from_be_bytes(id) != end {
                return errcorrupt!(
                    "segment {} record at offset {offset} has id {}, expected {end}",
                    self.file_num,
                    u64::from_be_bytes(id)
                );
            }
            end -= 1;
        }

        self.header.entry_end = index;
        self.header.body_end = offset;
        if let Some(offsets) = &mut self.offsets {
            offsets.split_off(&(index + 1));
        }
        self.write_header()?;
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes buffered appends to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Returns a duplicate file handle, used by sync handles to fsync the
    /// segment without holding the log lock.
    pub fn dup(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// Deletes the segment file.
    pub fn delete(self, dir: &Path) -> Result<()> {
        std::fs::remove_file(dir.join(file_name(self.file_num)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(index: Index, term: u64, command: &str) -> Entry {
        let command = match command {
            "" => None,
            c => Some(c.as_bytes().to_vec()),
        };
        Entry { index, term, command }
    }

    #[test]
    fn append_get_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut segment = Segment::create(dir.path(), 1, 1)?;
        segment.append(&entry(1, 1, ""))?;
        segment.append(&entry(2, 1, "a"))?;
        segment.append(&entry(3, 2, "bc"))?;
        segment.write_header()?;
        segment.sync()?;
        drop(segment);

        let mut segment = Segment::open(dir.path(), 1, true)?;
        assert_eq!(segment.header.entry_start, 1);
        assert_eq!(segment.header.entry_end, 3);
        assert_eq!(segment.get(2)?, Some(entry(2, 1, "a")));
        assert_eq!(segment.get(3)?, Some(entry(3, 2, "bc")));
        assert_eq!(segment.get(4)?, None);
        assert_eq!(segment.get(0)?, None);
        Ok(())
    }

    #[test]
    fn torn_suffix_is_discarded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut segment = Segment::create(dir.path(), 1, 1)?;
        segment.append(&entry(1, 1, "a"))?;
        segment.append(&entry(2, 1, "b"))?;
        segment.write_header()?;
        segment.sync()?;
        let body_end = segment.header.body_end;
        drop(segment);

        // Simulate a crash mid-append: a partial record past the header's
        // acknowledged body.
        let mut file = OpenOptions::new().append(true).open(dir.path().join(file_name(1)))?;
        file.write_all(&3u64.to_be_bytes())?;
        file.write_all(&[0x07, 0x00])?;
        drop(file);

        let mut segment = Segment::open(dir.path(), 1, true)?;
        assert_eq!(segment.header.entry_end, 2);
        assert_eq!(segment.header.body_end, body_end);
        assert_eq!(segment.file.metadata()?.len(), body_end);
        assert_eq!(segment.get(2)?, Some(entry(2, 1, "b")));

        // The segment must accept appends after repair.
        segment.append(&entry(3, 2, "c"))?;
        segment.write_header()?;
        assert_eq!(segment.get(3)?, Some(entry(3, 2, "c")));
        Ok(())
    }

    #[test]
    fn unheadered_records_survive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut segment = Segment::create(dir.path(), 1, 1)?;
        segment.append(&entry(1, 1, "a"))?;
        segment.write_header()?;
        // Crash before the header write: the record for entry 2 is complete
        // on disk but unacknowledged.
        segment.append(&entry(2, 1, "b"))?;
        segment.sync()?;
        drop(segment);

        let mut segment = Segment::open(dir.path(), 1, true)?;
        assert_eq!(segment.header.entry_end, 2);
        assert_eq!(segment.get(2)?, Some(entry(2, 1, "b")));
        Ok(())
    }

    #[test]
    fn truncate_reverse_scan() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut segment = Segment::create(dir.path(), 1, 1)?;
        for i in 1..=5 {
            segment.append(&entry(i, 1, &format!("cmd{i}")))?;
        }
        segment.write_header()?;

        segment.truncate(2)?;
        assert_eq!(segment.header.entry_end, 2);
        assert_eq!(segment.get(3)?, None);
        assert_eq!(segment.get(2)?, Some(entry(2, 1, "cmd2")));

        // Truncation and its header rewrite must survive reopening.
        drop(segment);
        let mut segment = Segment::open(dir.path(), 1, true)?;
        assert_eq!(segment.header.entry_end, 2);
        assert_eq!(segment.get(2)?, Some(entry(2, 1, "cmd2")));

        // Truncating to entry_start - 1 empties the segment.
        segment.truncate(0)?;
        assert_eq!(segment.header.entry_end, 0);
        assert_eq!(segment.header.body_end, HEADER_LEN);
        assert_eq!(segment.get(1)?, None);
        Ok(())
    }

    #[test]
    fn file_names() {
        assert_eq!(file_name(7), "0000000007.log");
        assert_eq!(parse_file_name("0000000007.log"), Some(7));
        assert_eq!(parse_file_name("manifest"), None);
        assert_eq!(parse_file_name("7.log"), None);
    }
}
