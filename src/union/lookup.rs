//! The per-branch scan that builds a fan-out for one name under one parent.
//!
//! Branches are visited in priority order from the parent's `start` down to
//! its `end` or opacity bound, whichever comes first. A whiteout found along
//! the way shadows everything deeper; a positive non-directory stops the
//! scan (files never fan out); a positive directory keeps scanning unless it
//! is opaque. The first negative slot encountered is remembered so a future
//! create knows where to begin.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use fuser::FileType;

use crate::union::branch::BranchTable;
use crate::union::convert::{io_error_to_errno, metadata_to_filetype};
use crate::union::sioq::SideIo;
use crate::union::types::{Fanout, LookupMode, LowerRef};
use crate::union::whiteout::{is_valid_name, Whiteout};

/// What the branch scan found for a name.
#[derive(Debug)]
pub(crate) enum LookupOutcome {
    /// At least one branch holds the object; the fan-out bounds it.
    Positive { fanout: Fanout },
    /// No branch holds the object. `slot` is the branch a create should
    /// start from: the first branch whose parent directory could hold the
    /// name (or the branch where a whiteout stopped the scan).
    Negative { slot: i32 },
}

pub(crate) fn lower_ref_of(meta: &fs::Metadata) -> LowerRef {
    use std::os::unix::fs::MetadataExt;
    LowerRef {
        kind: metadata_to_filetype(meta),
        mtime: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        ctime: crate::union::convert::ctime_of(meta),
        nlink: meta.nlink() as u32,
    }
}

/// Probe one branch directory for a whiteout of `name`.
///
/// Returns `Ok(true)` if a regular-file whiteout exists. Any other object
/// type in a whiteout slot is corrupt state and reported as `EIO`.
fn whiteout_at(dir: &Path, name: &OsStr) -> Result<bool, i32> {
    let marker = Whiteout::marker_path(dir, name);
    match fs::symlink_metadata(&marker) {
        Ok(meta) => {
            if meta.is_file() {
                Ok(true)
            } else {
                tracing::warn!("invalid whiteout entry type at {:?}", marker);
                Err(libc::EIO)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error_to_errno(&e)),
    }
}

/// Build (or extend, in partial mode) the fan-out for `name` under a parent
/// whose own fan-out is already valid.
///
/// `existing` carries the child's current fan-out for `Partial` re-scans;
/// in every other mode a fresh fan-out is populated.
pub(crate) fn lookup_fanout(
    branches: &BranchTable,
    sioq: &SideIo,
    parent_path: &Path,
    parent_fanout: &Fanout,
    name: &OsStr,
    mode: LookupMode,
    existing: Option<Fanout>,
) -> Result<LookupOutcome, i32> {
    if !is_valid_name(name) {
        return Err(libc::EPERM);
    }

    let mut fanout = match (mode, existing) {
        (LookupMode::Partial, Some(f)) => f,
        _ => Fanout::new(branches.len()),
    };

    let child_rel = parent_path.join(name);

    let bstart = parent_fanout.start();
    let mut bend = parent_fanout.end();
    if parent_fanout.opaque() >= 0 && parent_fanout.opaque() < bend {
        bend = parent_fanout.opaque();
    }
    debug_assert!(bstart >= 0, "lookup under a negative parent");

    let mut first_neg: i32 = -1;
    let mut positives = 0usize;

    for bindex in bstart..=bend {
        // Partial scans only fill holes.
        if mode == LookupMode::Partial && fanout.lower(bindex).is_some() {
            positives += 1;
            continue;
        }

        // The parent must be present, and a directory, on this branch.
        let parent_ref = match parent_fanout.lower(bindex) {
            Some(r) => r,
            None => continue,
        };
        if parent_ref.kind != FileType::Directory {
            continue;
        }

        let lower_dir = branches.path_on(bindex, parent_path);

        // A whiteout here shadows every deeper branch.
        if whiteout_at(&lower_dir, name)? {
            fanout.set_end(bindex);
            fanout.set_opaque(bindex);
            break;
        }

        let lower_path = branches.path_on(bindex, &child_rel);
        let meta = match fs::symlink_metadata(&lower_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Remember the first negative slot for a future create; it
                // does not populate the fan-out.
                if first_neg < 0 && fanout.start() < 0 {
                    first_neg = bindex;
                }
                continue;
            }
            Err(e) => return Err(io_error_to_errno(&e)),
        };

        let lref = lower_ref_of(&meta);
        let kind = lref.kind;

        positives += 1;
        // A partial scan may fill a hole left of the current bounds.
        if fanout.start() < 0 || bindex < fanout.start() {
            fanout.set_start(bindex);
        }
        fanout.set_lower(bindex, lref);
        if bindex > fanout.end() {
            fanout.set_end(bindex);
        }

        if kind != FileType::Directory {
            // Files terminate the scan; partial scans keep going so a
            // query can see every branch holding the name.
            if mode == LookupMode::Partial {
                continue;
            }
            break;
        }

        if sioq.is_opaque(lower_path)? {
            fanout.set_end(bindex);
            fanout.set_opaque(bindex);
            break;
        }
    }

    if positives > 0 {
        fanout.assert_consistent(None);
        Ok(LookupOutcome::Positive { fanout })
    } else {
        // Only a whiteout-terminated scan can leave no negative slot; the
        // whiteout's own branch is then where a create would land.
        let slot = if first_neg >= 0 {
            first_neg
        } else if fanout.end() >= 0 {
            fanout.end()
        } else {
            bstart
        };
        Ok(LookupOutcome::Negative { slot })
    }
}
