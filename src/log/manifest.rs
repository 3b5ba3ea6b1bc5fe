use super::{Index, Term};
use crate::errcorrupt;
use crate::error::Result;
use crate::raft::NodeAddr;

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Write as _};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// The manifest file name within the data directory.
const FILE_NAME: &str = "manifest";

/// The temporary file used for atomic replacement.
const TMP_NAME: &str = "manifest.tmp";

/// The fixed manifest record size: active_file_num, entry_start, entry_end,
/// current_term, and last_applied as big-endian u64, plus voted_for as a
/// big-endian u32 ip and u32 port.
const RECORD_LEN: usize = 48;

/// Consensus metadata persisted in the manifest. The invariants that must
/// survive a crash: current_term is non-decreasing, at most one voted_for
/// exists per term, and last_applied never exceeds the last log index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// The current term.
    pub current_term: Term,
    /// Our leader vote in the current term, if any.
    pub voted_for: Option<NodeAddr>,
    /// The last log index applied to the state machine.
    pub last_applied: Index,
}

/// The manifest records which segment is actively written, its index range,
/// and the consensus metadata. It is the first thing recovery reads. Updates
/// use a durable replace pattern (write a temporary file, fsync, rename over
/// the original) so recovery always sees a fully-written copy.
pub struct Manifest {
    path: PathBuf,
    tmp_path: PathBuf,
    /// The file number of the segment currently being written.
    pub active_file_num: u64,
    /// The first index of the active segment.
    pub entry_start: Index,
    /// The last index of the active segment. May lag the segment header; the
    /// header is authoritative and recovery reconciles them.
    pub entry_end: Index,
    /// The consensus metadata record.
    pub metadata: Metadata,
}

impl Manifest {
    /// Creates and persists a fresh manifest for an empty log.
    pub fn create(dir: &Path) -> Result<Self> {
        let manifest = Self {
            path: dir.join(FILE_NAME),
            tmp_path: dir.join(TMP_NAME),
            active_file_num: 1,
            entry_start: 1,
            entry_end: 0,
            metadata: Metadata::default(),
        };
        manifest.save()?;
        Ok(manifest)
    }

    /// Loads the manifest from the data directory, or returns None if there
    /// is none (a fresh data directory).
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(FILE_NAME);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() != RECORD_LEN {
            return errcorrupt!("manifest is {} bytes, expected {RECORD_LEN}", buf.len());
        }

        let mut fields = buf.chunks_exact(8);
        let mut next = || u64::from_be_bytes(fields.next().unwrap().try_into().unwrap());
        let active_file_num = next();
        let entry_start = next();
        let entry_end = next();
        let current_term = next();
        let voted = next();
        let last_applied = next();

        let (ip, port) = ((voted >> 32) as u32, voted as u32);
        if port > u16::MAX as u32 {
            return errcorrupt!("invalid voted_for port {port}");
        }
        let voted_for = match (ip, port) {
            (0, 0) => None,
            (ip, port) => Some(NodeAddr::new(Ipv4Addr::from(ip), port as u16)),
        };

        if entry_start == 0 || entry_end < entry_start - 1 {
            return errcorrupt!("invalid manifest index range {entry_start}..{entry_end}");
        }

        Ok(Some(Self {
            path,
            tmp_path: dir.join(TMP_NAME),
            active_file_num,
            entry_start,
            entry_end,
            metadata: Metadata { current_term, voted_for, last_applied },
        }))
    }

    /// Persists the manifest: write a temporary copy, fsync it, then rename
    /// it over the original.
    pub fn save(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(RECORD_LEN);
        buf.extend_from_slice(&self.active_file_num.to_be_bytes());
        buf.extend_from_slice(&self.entry_start.to_be_bytes());
        buf.extend_from_slice(&self.entry_end.to_be_bytes());
        buf.extend_from_slice(&self.metadata.current_term.to_be_bytes());
        let voted = match self.metadata.voted_for {
            Some(addr) => (u64::from(u32::from(*addr.ip())) << 32) | addr.port() as u64,
            None => 0,
        };
        buf.extend_from_slice(&voted.to_be_bytes());
        buf.extend_from_slice(&self.metadata.last_applied.to_be_bytes());

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn load_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(Manifest::load(dir.path())?.is_none());
        Ok(())
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manifest = Manifest::create(dir.path())?;
        manifest.active_file_num = 3;
        manifest.entry_start = 10;
        manifest.entry_end = 17;
        manifest.metadata = Metadata {
            current_term: 5,
            voted_for: Some(NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), 9701)),
            last_applied: 12,
        };
        manifest.save()?;

        let loaded = Manifest::load(dir.path())?.expect("manifest not found");
        assert_eq!(loaded.active_file_num, 3);
        assert_eq!(loaded.entry_start, 10);
        assert_eq!(loaded.entry_end, 17);
        assert_eq!(loaded.metadata, manifest.metadata);
        Ok(())
    }

    #[test]
    fn fresh_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        Manifest::create(dir.path())?;
        let loaded = Manifest::load(dir.path())?.expect("manifest not found");
        assert_eq!(loaded.active_file_num, 1);
        assert_eq!(loaded.entry_start, 1);
        assert_eq!(loaded.entry_end, 0);
        assert_eq!(loaded.metadata, Metadata::default());
        Ok(())
    }

    #[test]
    fn truncated_record_is_corrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        Manifest::create(dir.path())?;
        std::fs::write(dir.path().join(FILE_NAME), [0u8; 17])?;
        assert!(matches!(Manifest::load(dir.path()), Err(Error::Corrupt(_))));
        Ok(())
    }
}
