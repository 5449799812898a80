pub mod error;
pub mod union;

pub use error::{Result, StrataError};

pub use union::branch::{parse_dirs_spec, parse_mount_options, BranchPerm, BranchSpec};
pub use union::mount::{mount_union, spawn_mount, MountConfig};
pub use union::{SetattrRequest, UnionFs};
