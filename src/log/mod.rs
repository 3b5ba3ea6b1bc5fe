//! The durable replicated log: a sequence of segment files plus a manifest
//! holding the consensus metadata record. In the steady state the log is
//! append-only; the only permitted mutation is truncation of a contiguous
//! suffix, which happens when a newer leader's history diverges from ours.
//!
//! The log has the following invariants:
//!
//! * Entry indexes are contiguous starting at 1 (no index gaps).
//! * Entry terms never decrease from the previous entry.
//! * After a successful sync, appended entries survive a process crash.
//! * After truncate_suffix(k), no entry above k is observable, even after a
//!   crash.
//! * Entries with the same index/term contain the same command.

mod manifest;
mod segment;

pub use manifest::Metadata;

use manifest::Manifest;
use segment::Segment;

use crate::errcorrupt;
use crate::error::Result;
use crate::raft::NodeAddr;

use ::log::warn;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A leader term. Starts at 0 for an empty cluster.
pub type Term = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was created by its originating leader.
    pub term: Term,
    /// The state machine command. None is a noop, appended by a newly
    /// elected leader to advance the commit frontier into its term.
    pub command: Option<Vec<u8>>,
}

/// Default maximum segment body size before the active segment is split.
const SEGMENT_SIZE: u64 = 4 << 20;

/// The durable log. Thread-safe behind an internal mutex: append, get, and
/// truncate_suffix may be called with the consensus mutex held, but
/// SyncHandle::wait must not be, since it blocks on the disk.
pub struct Log {
    inner: Mutex<Inner>,
}

struct Inner {
    dir: PathBuf,
    manifest: Manifest,
    /// The segment currently being written.
    active: Segment,
    /// Sealed (read-only) segments, keyed by their first entry index.
    sealed: BTreeMap<Index, Segment>,
    /// The term of the last entry, cached to avoid a disk read per access.
    last_term: Term,
    max_segment_size: u64,
}

/// A handle to the disk state at the time it was taken. wait() blocks until
/// every append queued before the handle was taken is durable. Must be
/// waited on without holding the consensus mutex.
pub struct SyncHandle {
    file: File,
    /// The last appended index covered by this handle.
    pub last_index: Index,
}

impl SyncHandle {
    /// Blocks until the covered appends are durable.
    pub fn wait(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Log {
    /// Opens or creates a log in the given directory, recovering any
    /// existing state.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with(dir, SEGMENT_SIZE)
    }

    /// Opens a log with a custom segment size limit. Mainly for tests, which
    /// use small limits to exercise splitting.
    pub fn open_with(dir: &Path, max_segment_size: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let manifest = match Manifest::load(dir)? {
            Some(manifest) => manifest,
            None => Manifest::create(dir)?,
        };

        // Enumerate segment files. Files above the active one are orphans
        // from a crash between creating a segment and saving the manifest.
        let mut file_nums = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let name = dirent?.file_name();
            if let Some(num) = segment::parse_file_name(&name.to_string_lossy()) {
                file_nums.push(num);
            }
        }
        file_nums.sort();

        let mut sealed = BTreeMap::new();
        let mut active = None;
        for num in file_nums {
            if num < manifest.active_file_num {
                let segment = Segment::open(dir, num, false)?;
                sealed.insert(segment.header.entry_start, segment);
            } else if num == manifest.active_file_num {
                active = Some(Segment::open(dir, num, true)?);
            } else {
                warn!("removing orphaned segment file {num}");
                std::fs::remove_file(dir.join(segment::file_name(num)))?;
            }
        }
        let mut active = match active {
            Some(active) => active,
            None if sealed.is_empty() && manifest.entry_start == 1 => {
                Segment::create(dir, manifest.active_file_num, 1)?
            }
            None => return errcorrupt!("active segment {} missing", manifest.active_file_num),
        };

        // The segments must chain contiguously from index 1.
        let mut next = 1;
        for segment in sealed.values().chain(std::iter::once(&active)) {
            if segment.header.entry_start != next {
                return errcorrupt!(
                    "segment {} starts at {}, expected {next}",
                    segment.file_num,
                    segment.header.entry_start
                );
            }
            next = segment.header.entry_end + 1;
        }
        if active.header.entry_start != manifest.entry_start {
            return errcorrupt!(
                "active segment starts at {}, manifest says {}",
                active.header.entry_start,
                manifest.entry_start
            );
        }

        // The active segment can be empty (e.g. after a cross-segment
        // truncation), so the last term lookup must span all segments.
        let last_index = active.header.entry_end;
        if manifest.metadata.last_applied > last_index {
            return errcorrupt!(
                "applied index {} is beyond the last log index {last_index}",
                manifest.metadata.last_applied
            );
        }
        let mut inner = Inner {
            dir: dir.to_path_buf(),
            manifest,
            active,
            sealed,
            last_term: 0,
            max_segment_size,
        };
        inner.manifest.entry_end = last_index;
        if last_index > 0 {
            inner.last_term = inner.get(last_index)?.expect("last entry must exist").term;
        }
        Ok(Self { inner: Mutex::new(inner) })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("log mutex poisoned")
    }

    /// Appends a batch of entries, which must extend the log contiguously
    /// with non-decreasing terms. Returns the index range appended. The
    /// entries are not durable until a subsequent sync handle is waited on.
    pub fn append(&self, entries: Vec<Entry>) -> Result<(Index, Index)> {
        let mut inner = self.inner();
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            panic!("appended empty entry batch");
        };
        assert_eq!(first.index, inner.active.header.entry_end + 1, "append index gap");
        let (first, last) = (first.index, last.index);

        for entry in &entries {
            assert!(entry.term >= inner.last_term, "entry term regression");
            assert!(entry.term > 0, "entry term 0");
            if inner.active.header.body_end >= inner.max_segment_size {
                inner.split()?;
            }
            inner.active.append(entry)?;
            inner.last_term = entry.term;
        }
        inner.active.write_header()?;
        inner.manifest.entry_end = last;
        Ok((first, last))
    }

    /// Truncates the log so that the given index is the last one kept,
    /// deleting or shrinking segments from the tail. Persists before
    /// returning; a no-op if the index is at or above the last index.
    pub fn truncate_suffix(&self, last_index_to_keep: Index) -> Result<()> {
        let mut inner = self.inner();
        if last_index_to_keep >= inner.active.header.entry_end {
            return Ok(());
        }

        // Drop whole segments from the tail until the cut point lands in
        // the active one.
        while last_index_to_keep + 1 < inner.active.header.entry_start {
            let (_, previous) = inner.sealed.pop_last().expect("log has a gap below the cut point");
            let dir = inner.dir.clone();
            std::mem::replace(&mut inner.active, previous).delete(&dir)?;
        }
        inner.active.truncate(last_index_to_keep)?;

        inner.manifest.active_file_num = inner.active.file_num;
        inner.manifest.entry_start = inner.active.header.entry_start;
        inner.manifest.entry_end = inner.active.header.entry_end;
        inner.manifest.save()?;

        inner.last_term = match last_index_to_keep {
            0 => 0,
            index => inner.get(index)?.expect("kept entry must exist").term,
        };
        Ok(())
    }

    /// Fetches the entry at an index, or None if it was truncated or never
    /// existed.
    pub fn get(&self, index: Index) -> Result<Option<Entry>> {
        self.inner().get(index)
    }

    /// The first index in the log. Always 1 until prefix truncation exists.
    pub fn first_index(&self) -> Index {
        let inner = self.inner();
        match inner.sealed.first_key_value() {
            Some((start, _)) => *start,
            None => inner.active.header.entry_start,
        }
    }

    /// The last index in the log, or 0 if empty.
    pub fn last_index(&self) -> Index {
        self.inner().active.header.entry_end
    }

    /// The term of the last entry, or 0 if the log is empty.
    pub fn last_term(&self) -> Term {
        self.inner().last_term
    }

    /// Returns the persisted consensus metadata.
    pub fn metadata(&self) -> Metadata {
        self.inner().manifest.metadata.clone()
    }

    /// Durably persists the consensus metadata record, via the manifest's
    /// atomic replace. Must return before e.g. a vote reply is sent.
    pub fn update_metadata(
        &self,
        current_term: Term,
        voted_for: Option<NodeAddr>,
        last_applied: Index,
    ) -> Result<()> {
        let mut inner = self.inner();
        inner.manifest.metadata = Metadata { current_term, voted_for, last_applied };
        inner.manifest.save()
    }

    /// Returns a sync handle covering all appends queued so far. Sealed
    /// segments are synced when they are split off, so the handle only needs
    /// to cover the active segment.
    pub fn sync(&self) -> Result<SyncHandle> {
        let inner = self.inner();
        Ok(SyncHandle { file: inner.active.dup()?, last_index: inner.active.header.entry_end })
    }
}

impl Drop for Log {
    /// Attempt to flush on drop, in case appends were never synced.
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.lock() {
            inner.active.sync().ok();
            inner.manifest.save().ok();
        }
    }
}

impl Inner {
    fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        if index == 0 {
            return Ok(None);
        }
        if index >= self.active.header.entry_start {
            return self.active.get(index);
        }
        match self.sealed.range_mut(..=index).next_back() {
            Some((_, segment)) => segment.get(index),
            None => Ok(None),
        }
    }

    /// Seals the active segment and opens a fresh one. Splits are always on
    /// entry boundaries; the sealed segment is synced so later sync handles
    /// need not cover it.
    fn split(&mut self) -> Result<()> {
        self.active.write_header()?;
        self.active.sync()?;

        let file_num = self.active.file_num + 1;
        let entry_start = self.active.header.entry_end + 1;
        let next = Segment::create(&self.dir, file_num, entry_start)?;
        let sealed = std::mem::replace(&mut self.active, next);
        self.sealed.insert(sealed.header.entry_start, sealed);

        self.manifest.active_file_num = file_num;
        self.manifest.entry_start = entry_start;
        self.manifest.entry_end = entry_start - 1;
        self.manifest.save()
    }
}
