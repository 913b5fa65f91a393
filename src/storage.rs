//! Output storage
//!
//! Free-space probing and timestamp-named output paths.

use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

pub const MIB: u64 = 1024 * 1024;

/// Reports free space for a directory
pub trait FreeSpace: Send + Sync {
    /// Bytes available to the current user at `path`
    fn available_bytes(&self, path: &Path) -> Result<u64>;

    fn available_mib(&self, path: &Path) -> Result<u64> {
        Ok(self.available_bytes(path)? / MIB)
    }
}

/// Free space from the mounted filesystems
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemStorage;

impl FreeSpace for SystemStorage {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let target = existing_ancestor(path)?;
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // The disk with the longest mount point containing the path
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("No mounted filesystem holds {}", target.display()),
                ))
            })
    }
}

/// Free space that always reports the same amount
#[derive(Debug, Clone, Copy)]
pub struct FixedStorage {
    pub bytes: u64,
}

impl FixedStorage {
    pub fn mib(mib: u64) -> Self {
        Self { bytes: mib * MIB }
    }
}

impl FreeSpace for FixedStorage {
    fn available_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.bytes)
    }
}

fn existing_ancestor(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let existing = absolute
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    Ok(existing.canonicalize()?)
}

/// Check free space against a floor; an unreadable disk lets the check pass
pub fn check_free_space(space: &dyn FreeSpace, dir: &Path, min_free_mib: u64) -> Result<()> {
    match space.available_mib(dir) {
        Ok(available_mib) if available_mib < min_free_mib => Err(Error::InsufficientStorage {
            available_mib,
            required_mib: min_free_mib,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!("Could not read free space at {}: {}", dir.display(), e);
            Ok(())
        }
    }
}

/// File name for a recording started at `when`
pub fn output_file_name(prefix: &str, when: &DateTime<Local>, extension: &str) -> String {
    format!("{}-{}.{}", prefix, when.format("%Y-%m-%d-%H-%M-%S"), extension)
}

/// Create the output directory and pick a file name not already taken.
/// Collisions get a `-N` suffix.
pub fn allocate_output_path(
    dir: &Path,
    prefix: &str,
    when: &DateTime<Local>,
    extension: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let stem = format!("{}-{}", prefix, when.format("%Y-%m-%d-%H-%M-%S"));
    let mut candidate = dir.join(format!("{}.{}", stem, extension));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}-{}.{}", stem, n, extension));
        n += 1;
    }
    tracing::debug!("Output path: {}", candidate.display());
    Ok(candidate)
}
