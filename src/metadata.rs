//! The metadata record stored alongside every archived file.
//!
//! One of these travels in the `.bupm` sidecar for each non-directory entry
//! (plus one for the directory itself), and in the metadata store the index
//! keeps next to itself. Records are CBOR, self-delimiting, and meant to be
//! concatenated into a stream.

use std::fs;
use std::io::Read;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Everything we record about a filesystem entry besides its contents.
///
/// Timestamps are nanoseconds since the epoch. A default-constructed record
/// (mode 0, everything empty) stands in for directories we can't or
/// shouldn't stat - synthetic graft parents and collided roots.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size: Option<u64>,
    pub symlink_target: Option<Utf8PathBuf>,
    pub hardlink_target: Option<Utf8PathBuf>,
}

impl Metadata {
    /// Read metadata from the filesystem without following symlinks.
    pub fn from_path(path: &Utf8Path) -> Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let m = fs::symlink_metadata(path).with_context(|| format!("Couldn't stat {path}"))?;

        let symlink_target = if m.file_type().is_symlink() {
            let t = fs::read_link(path).with_context(|| format!("Couldn't readlink {path}"))?;
            Some(
                Utf8PathBuf::from_path_buf(t)
                    .map_err(|t| anyhow::anyhow!("{path} links to non-UTF-8 target {t:?}"))?,
            )
        } else {
            None
        };

        Ok(Self {
            mode: m.mode(),
            uid: m.uid(),
            gid: m.gid(),
            atime: m.atime() * 1_000_000_000 + m.atime_nsec(),
            mtime: m.mtime() * 1_000_000_000 + m.mtime_nsec(),
            ctime: m.ctime() * 1_000_000_000 + m.ctime_nsec(),
            size: m.file_type().is_file().then(|| m.len()),
            symlink_target,
            hardlink_target: None,
        })
    }

    #[inline]
    pub fn type_bits(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.type_bits() == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.type_bits() == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.type_bits() == S_IFLNK
    }

    /// The metadata store keeps times zeroed; they live in the index and are
    /// restored from it when an entry is reused.
    pub fn clear_times(&mut self) {
        self.atime = 0;
        self.mtime = 0;
        self.ctime = 0;
    }

    /// Append this record's encoding to a byte stream.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        ciborium::ser::into_writer(self, out).context("Couldn't encode metadata record")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Read the next record from a stream of concatenated records.
    /// Returns `None` at a clean end-of-stream.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let mut first = [0u8; 1];
        if r.read(&mut first)? == 0 {
            return Ok(None);
        }
        let meta = ciborium::de::from_reader(first.as_slice().chain(r))
            .context("Couldn't decode metadata record")?;
        Ok(Some(meta))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    fn sample(mode: u32, size: u64) -> Metadata {
        Metadata {
            mode,
            uid: 1000,
            gid: 1000,
            atime: 1_600_000_000_000_000_000,
            mtime: 1_600_000_001_000_000_000,
            ctime: 1_600_000_002_000_000_000,
            size: Some(size),
            symlink_target: None,
            hardlink_target: None,
        }
    }

    #[test]
    fn stream_round_trip() -> Result<()> {
        let records = vec![
            Metadata::default(),
            sample(0o100644, 42),
            Metadata {
                symlink_target: Some(Utf8PathBuf::from("over/there")),
                mode: 0o120777,
                ..Metadata::default()
            },
        ];

        let mut stream = Vec::new();
        for r in &records {
            r.encode_into(&mut stream)?;
        }

        let mut cursor = Cursor::new(stream);
        let mut back = Vec::new();
        while let Some(m) = Metadata::read_from(&mut cursor)? {
            back.push(m);
        }
        assert_eq!(records, back);
        Ok(())
    }

    #[test]
    fn from_path_sees_symlinks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        std::os::unix::fs::symlink("target", dir.join("ln"))?;

        let meta = Metadata::from_path(&dir.join("ln"))?;
        assert!(meta.is_symlink());
        assert_eq!(meta.symlink_target.as_deref(), Some(Utf8Path::new("target")));
        assert_eq!(meta.size, None);
        Ok(())
    }
}
