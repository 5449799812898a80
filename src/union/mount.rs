//! Mounting the union over FUSE.

use std::path::Path;

use crate::error::{Result, StrataError};
use crate::union::branch::BranchSpec;
use crate::union::UnionFs;

/// Options for the FUSE session itself, distinct from the union's own
/// `dirs=` configuration.
#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// Attribute/entry cache TTL handed to the kernel, in seconds.
    pub ttl_secs: u64,
}

fn fuse_options(config: &MountConfig) -> Vec<fuser::MountOption> {
    // Permission decisions stay with the union's own access logic; the
    // kernel enforcing mode bits up front would block the copy-up path
    // for read-only lower files.
    let mut options = vec![fuser::MountOption::FSName("stratafs".to_string())];
    if config.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if config.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    options
}

/// Mount and serve until unmounted. This call blocks; it is what the
/// foreground binary runs.
pub fn mount_union(
    mountpoint: &Path,
    specs: Vec<BranchSpec>,
    config: &MountConfig,
) -> Result<()> {
    let fs = UnionFs::new(specs, config.ttl_secs)?;
    tracing::info!("mounting stratafs at {}", mountpoint.display());
    fuser::mount2(fs, mountpoint, &fuse_options(config))
        .map_err(|e| StrataError::Mount(e.to_string()))
}

/// Mount in a background session; dropping the returned guard unmounts.
pub fn spawn_mount(
    mountpoint: &Path,
    specs: Vec<BranchSpec>,
    config: &MountConfig,
) -> Result<fuser::BackgroundSession> {
    let fs = UnionFs::new(specs, config.ttl_secs)?;
    tracing::info!("mounting stratafs (background) at {}", mountpoint.display());
    fuser::spawn_mount2(fs, mountpoint, &fuse_options(config))
        .map_err(|e| StrataError::Mount(e.to_string()))
}
