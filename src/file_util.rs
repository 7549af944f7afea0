//! Utilities for opening files politely and persisting them atomically.

use std::fs::File;
use std::io::{self, Write};

use anyhow::{Context, Result};
use camino::Utf8Path;

/// Open a file for reading without bumping its access time, if the OS lets us.
///
/// Backup tools that trample atimes make incremental anything miserable.
/// O_NOATIME is only allowed for the file's owner (or root), so fall back to
/// a plain open when the kernel says no.
#[cfg(target_os = "linux")]
pub fn open_noatime(path: &Utf8Path) -> io::Result<File> {
    use rustix::fs::{Mode, OFlags};

    match rustix::fs::open(
        path.as_std_path(),
        OFlags::RDONLY | OFlags::NOATIME | OFlags::CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => Ok(File::from(fd)),
        Err(rustix::io::Errno::PERM) => File::open(path),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn open_noatime(path: &Utf8Path) -> io::Result<File> {
    File::open(path)
}

/// Write `bytes` to `to` through a temporary file and a rename,
/// so `to` never holds a partial write.
pub fn write_atomic(to: &Utf8Path, bytes: &[u8]) -> Result<()> {
    let parent = to.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut fh = tempfile::Builder::new()
        .prefix(".duffel-tmp-")
        .tempfile_in(parent)
        .with_context(|| format!("Couldn't open a temporary file in {parent}"))?;
    fh.write_all(bytes)
        .with_context(|| format!("Couldn't write {to}"))?;
    fh.as_file().sync_all()?;
    fh.persist(to)
        .with_context(|| format!("Couldn't persist {to}"))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atomic_write_lands() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = Utf8Path::from_path(dir.path()).unwrap().join("out.bin");
        write_atomic(&target, b"contents")?;
        assert_eq!(std::fs::read(&target)?, b"contents");
        // No leftover temporaries.
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }
}
