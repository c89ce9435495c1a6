//! Read-only lock of the backed up paths while borg reads them.
//!
//! Original modes are only held in memory. They are put back when
//! [`PermissionLock::restore`] is called or, failing that, when the lock is dropped.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::WithMsg;
use std::fs::{set_permissions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::{info, warn};
use walkdir::WalkDir;

const WRITE_BITS: u32 = 0o222;

#[derive(Debug, Default)]
pub struct PermissionLock {
    saved: Vec<(PathBuf, u32)>,
}

impl PermissionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip write bits below every path in `paths`. Symlinks are left alone.
    ///
    /// Entries changed before an error are still restored later.
    pub fn lock_paths(&mut self, paths: &[PathBuf]) -> Result<usize> {
        let mut errors = Vec::new();
        let before = self.saved.len();
        for root in paths {
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        errors.push(Error::from(e));
                        continue;
                    }
                };
                if entry.file_type().is_symlink() {
                    continue;
                }
                let mode = match entry.metadata() {
                    Ok(metadata) => metadata.permissions().mode() & 0o7777,
                    Err(e) => {
                        errors.push(Error::from(e));
                        continue;
                    }
                };
                if mode & WRITE_BITS == 0 {
                    continue;
                }
                match set_permissions(entry.path(), Permissions::from_mode(mode & !WRITE_BITS)) {
                    Ok(()) => self.saved.push((entry.path().to_path_buf(), mode)),
                    Err(e) => errors.push(
                        Error::from(e).with_msg(format!("chmod {:?}", entry.path())),
                    ),
                }
            }
        }
        let locked = self.saved.len() - before;
        info!("Made {locked} entries read-only");
        convert_error_vec(errors).map(|_| locked)
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    /// Put every saved mode back, deepest entries first.
    pub fn restore(&mut self) -> Result<usize> {
        let mut errors = Vec::new();
        let mut restored = 0;
        while let Some((path, mode)) = self.saved.pop() {
            match set_permissions(&path, Permissions::from_mode(mode)) {
                Ok(()) => restored += 1,
                Err(e) => errors.push(Error::from(e).with_msg(format!("chmod {:?}", path))),
            }
        }
        info!("Restored permissions of {restored} entries");
        convert_error_vec(errors).map(|_| restored)
    }
}

impl Drop for PermissionLock {
    fn drop(&mut self) {
        if !self.saved.is_empty() {
            if let Err(e) = self.restore() {
                warn!("Restoring permissions failed: {e}");
            }
        }
    }
}
