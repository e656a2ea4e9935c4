use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fs4::FileExt;
use log::debug;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: u32 = 600;

/// Advisory cross-process lock held on a file until dropped.
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Acquires the lock, retrying while another process holds it.
    pub fn lock(path: &Path) -> Result<LockFile> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        for attempt in 0..MAX_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(LockFile {
                        path: path.to_path_buf(),
                        file,
                    })
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if attempt == 0 {
                        debug!("Waiting for lock on {}", path.display());
                    }
                    sleep(RETRY_INTERVAL);
                }
                Err(err) => return Err(err).with_context(|| format!("failed to lock {}", path.display())),
            }
        }
        Err(anyhow!("timed out waiting for lock on {}", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!("Failed to release lock {}: {}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lock");
        {
            let lock = LockFile::lock(&path).unwrap();
            assert_eq!(lock.path(), path.as_path());
            let other = OpenOptions::new().write(true).open(&path).unwrap();
            assert!(other.try_lock_exclusive().is_err());
        }
        let other = OpenOptions::new().write(true).open(&path).unwrap();
        other.try_lock_exclusive().unwrap();
    }
}
