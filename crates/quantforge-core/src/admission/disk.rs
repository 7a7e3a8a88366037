//! Free-space lookup for the volume holding a path.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::debug;

use crate::error::{QuantError, Result};

/// Source of free-space information for admission control.
pub trait DiskProbe: Send + Sync {
    /// Bytes available to the current user on the volume containing `path`.
    fn free_space(&self, path: &Path) -> Result<u64>;
}

/// [`DiskProbe`] backed by `sysinfo`'s mounted-disk list.
#[derive(Debug, Default)]
pub struct SysinfoDiskProbe;

impl SysinfoDiskProbe {
    pub fn new() -> Self {
        Self
    }
}

impl DiskProbe for SysinfoDiskProbe {
    fn free_space(&self, path: &Path) -> Result<u64> {
        let path = absolute(path)?;
        let disks = Disks::new_with_refreshed_list();

        // The disk whose mount point is the longest prefix of `path` holds it.
        let best = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());

        match best {
            Some(disk) => {
                debug!(
                    "{} is on {} ({} bytes free)",
                    path.display(),
                    disk.mount_point().display(),
                    disk.available_space()
                );
                Ok(disk.available_space())
            }
            None => Err(QuantError::Config {
                message: format!("no mounted volume found for {}", path.display()),
            }),
        }
    }
}

/// Canonicalize the nearest existing ancestor so mount matching sees real paths.
fn absolute(path: &Path) -> Result<PathBuf> {
    let mut probe = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| QuantError::io("reading current directory", path, e))?
            .join(path)
    };
    loop {
        if let Ok(real) = probe.canonicalize() {
            return Ok(real);
        }
        if !probe.pop() {
            return Ok(path.to_path_buf());
        }
    }
}
