//! Loose-object storage on the local filesystem.
//!
//! Objects live at `objects/xx/<rest of the hex>`, zstd-compressed, written
//! through a temp file so a crash never leaves a torn object. Refs are one
//! hex oid per file under `refs/heads/`.

use std::fs::{self, File};
use std::io;

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use super::{Kind, ObjectStore, object_id, valid_ref_name};
use crate::counters;
use crate::file_util;
use crate::hashing::ObjectId;

pub struct FsStore {
    root: Utf8PathBuf,
    compression_level: i32,
}

impl FsStore {
    /// Create an empty repository at `root`.
    pub fn init(root: &Utf8Path) -> Result<()> {
        ensure!(
            !root.join("objects").exists(),
            "A repository already exists at {root}"
        );
        fs::create_dir_all(root.join("objects"))
            .with_context(|| format!("Couldn't create {root}/objects"))?;
        fs::create_dir_all(root.join("refs/heads"))
            .with_context(|| format!("Couldn't create {root}/refs/heads"))?;
        info!("Initialized empty repository at {root}");
        Ok(())
    }

    pub fn open(root: &Utf8Path, compression_level: i32) -> Result<Self> {
        ensure!(
            root.join("objects").is_dir() && root.join("refs/heads").is_dir(),
            "{root} is not a repository; run `duffel init` first"
        );
        ensure!(
            (0..=9).contains(&compression_level),
            "Compression level must be between 0 and 9"
        );
        Ok(Self {
            root: root.to_owned(),
            compression_level,
        })
    }

    fn object_path(&self, id: &ObjectId) -> Utf8PathBuf {
        let hex = format!("{id}");
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, name: &str) -> Result<Utf8PathBuf> {
        ensure!(valid_ref_name(name), "Invalid ref name {name}");
        Ok(self.root.join("refs/heads").join(name))
    }
}

impl ObjectStore for FsStore {
    fn exists(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    fn write_object(&mut self, kind: Kind, payload: &[u8]) -> Result<ObjectId> {
        let id = object_id(kind, payload);
        let path = self.object_path(&id);
        if path.is_file() {
            counters::bump(counters::Op::ObjectsAlreadyStored);
            trace!("{} {id} already stored", kind.tag());
            return Ok(id);
        }

        let mut raw = Vec::with_capacity(payload.len() + 32);
        raw.extend_from_slice(format!("{} {}\0", kind.tag(), payload.len()).as_bytes());
        raw.extend_from_slice(payload);
        let compressed = zstd::encode_all(&raw[..], self.compression_level)
            .with_context(|| format!("Couldn't compress {id}"))?;

        fs::create_dir_all(path.parent().unwrap())?;
        file_util::write_atomic(&path, &compressed)?;
        trace!("Wrote {} {id} ({} bytes)", kind.tag(), payload.len());
        Ok(id)
    }

    fn read_object(&self, id: &ObjectId) -> Result<(Kind, Vec<u8>)> {
        let path = self.object_path(id);
        let fh = File::open(&path).with_context(|| format!("Couldn't open object {id}"))?;
        let raw = zstd::decode_all(fh).with_context(|| format!("Couldn't decompress {id}"))?;

        let nul = raw
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| anyhow::anyhow!("Object {id} has no header"))?;
        let header = std::str::from_utf8(&raw[..nul])?;
        let (tag, len) = header
            .split_once(' ')
            .ok_or_else(|| anyhow::anyhow!("Malformed header in object {id}"))?;
        let kind = Kind::from_tag(tag)?;
        let payload = raw[nul + 1..].to_vec();
        ensure!(
            payload.len() == len.parse::<usize>()?,
            "Object {id} is truncated"
        );
        ensure!(
            object_id(kind, &payload) == *id,
            "Object {id}'s contents changed! Now hashes to {}",
            object_id(kind, &payload)
        );
        Ok((kind, payload))
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        let path = self.ref_path(name)?;
        let contents = match fs::read_to_string(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            other => other.with_context(|| format!("Couldn't read ref {name}"))?,
        };
        Ok(Some(contents.trim().parse()?))
    }

    fn update_ref(
        &mut self,
        name: &str,
        new: &ObjectId,
        expected_old: Option<&ObjectId>,
    ) -> Result<()> {
        let path = self.ref_path(name)?;
        let current = self.read_ref(name)?;
        if current.as_ref() != expected_old {
            bail!(
                "Ref {name} moved underneath us (expected {:?}, found {:?})",
                expected_old.map(ObjectId::short_name),
                current.map(|c| c.short_name())
            );
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = format!("{new}");
        line.push('\n');
        file_util::write_atomic(&path, line.as_bytes())?;
        debug!("{name} -> {new}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_store() -> Result<(tempfile::TempDir, FsStore)> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap().join("repo");
        FsStore::init(&root)?;
        let store = FsStore::open(&root, 1)?;
        Ok((dir, store))
    }

    #[test]
    fn blob_round_trip() -> Result<()> {
        let (_dir, mut store) = scratch_store()?;

        let id = store.new_blob(b"hello")?;
        assert!(store.exists(&id));
        let (kind, payload) = store.read_object(&id)?;
        assert_eq!(kind, Kind::Blob);
        assert_eq!(payload, b"hello");

        // Idempotent.
        assert_eq!(store.new_blob(b"hello")?, id);
        Ok(())
    }

    #[test]
    fn ref_compare_and_swap() -> Result<()> {
        let (_dir, mut store) = scratch_store()?;
        let first = store.new_blob(b"first")?;
        let second = store.new_blob(b"second")?;

        assert_eq!(store.read_ref("main")?, None);
        store.update_ref("main", &first, None)?;
        assert_eq!(store.read_ref("main")?, Some(first));

        // Stale expectation loses.
        assert!(store.update_ref("main", &second, None).is_err());
        store.update_ref("main", &second, Some(&first))?;
        assert_eq!(store.read_ref("main")?, Some(second));
        Ok(())
    }
}
