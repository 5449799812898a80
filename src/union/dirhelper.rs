//! rmdir support: deciding whether a union directory is logically empty,
//! and deleting the whiteouts it still carries.
//!
//! A directory is logically empty iff every name appearing in any populated
//! branch at or above the opacity bound is either a whiteout itself or is
//! shadowed by a whiteout seen at a higher branch. A name and its whiteout
//! in the same branch is corrupt state and reported as `EIO`.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::Path;

use fuser::FileType;

use crate::union::branch::BranchTable;
use crate::union::convert::io_error_to_errno;
use crate::union::sioq::{SideIo, SideIoRequest};
use crate::union::types::Fanout;
use crate::union::whiteout::{Whiteout, DIR_OPAQUE_NAME};

/// One tallied name from the emptiness scan.
#[derive(Debug, Clone)]
pub(crate) struct TallyNode {
    /// Branch the entry was first seen on.
    pub bindex: i32,
    pub whiteout: bool,
}

/// The whiteouts found by a successful emptiness check, grouped so rmdir
/// can delete exactly what it saw.
#[derive(Debug, Default)]
pub(crate) struct NameList {
    entries: Vec<(OsString, i32)>,
}

impl NameList {
    pub fn names_on(&self, bindex: i32) -> Vec<OsString> {
        self.entries
            .iter()
            .filter(|(_, b)| *b == bindex)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn branches(&self) -> Vec<i32> {
        let mut out: Vec<i32> = self.entries.iter().map(|(_, b)| *b).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Scan every populated branch of a directory and tally names. Returns the
/// whiteouts found if the directory is logically empty, `ENOTEMPTY` if any
/// real entry survives, `EIO` on duplicate name/whiteout within one branch.
///
/// The caller must have filled the fan-out across all candidate branches
/// (partial lookup) first; this function only reads it.
pub(crate) fn check_empty(
    branches: &BranchTable,
    dir_rel: &Path,
    fanout: &Fanout,
) -> Result<NameList, i32> {
    let mut bend = fanout.end();
    if fanout.opaque() >= 0 && fanout.opaque() < bend {
        bend = fanout.opaque();
    }

    let mut tally: HashMap<OsString, TallyNode> = HashMap::new();
    let mut namelist = NameList::default();

    for bindex in fanout.start()..=bend {
        let lref = match fanout.lower(bindex) {
            Some(l) => l,
            None => continue,
        };
        if lref.kind != FileType::Directory {
            continue;
        }

        let dir = branches.path_on(bindex, dir_rel);
        let entries = fs::read_dir(&dir).map_err(|e| io_error_to_errno(&e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error_to_errno(&e))?;
            let raw_name = entry.file_name();

            let (name, whiteout) = match Whiteout::extract_target(&raw_name) {
                Some(target) => {
                    if target == OsStr::new(DIR_OPAQUE_NAME) {
                        // The opacity marker is namespace metadata, not
                        // a hidden entry.
                        continue;
                    }
                    (target, true)
                }
                None => (raw_name, false),
            };

            if let Some(prev) = tally.get(&name) {
                // Recorded entries are whiteouts; the same name appearing
                // twice within one branch is corrupt union state.
                if prev.bindex == bindex || !prev.whiteout {
                    tracing::warn!(
                        "duplicate entry for {:?} within branch {}",
                        name,
                        bindex
                    );
                    return Err(libc::EIO);
                }
                // A whiteout recorded at a higher branch shadows this one.
                continue;
            }

            if !whiteout {
                tracing::debug!("{:?} not empty: {:?} on branch {}", dir_rel, name, bindex);
                return Err(libc::ENOTEMPTY);
            }

            tally.insert(name.clone(), TallyNode { bindex, whiteout });
            namelist.entries.push((name, bindex));
        }
    }

    Ok(namelist)
}

/// Delete the whiteouts recorded by [`check_empty`] for one branch, through
/// the side-IO queue.
pub(crate) fn delete_whiteouts(
    branches: &BranchTable,
    sioq: &SideIo,
    dir_rel: &Path,
    bindex: i32,
    namelist: &NameList,
) -> Result<(), i32> {
    if branches.is_robranch(bindex) {
        return Err(libc::EROFS);
    }
    let names = namelist.names_on(bindex);
    if names.is_empty() {
        return Ok(());
    }
    sioq.submit(SideIoRequest::DeleteWhiteouts {
        dir: branches.path_on(bindex, dir_rel),
        names,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    use crate::union::branch::{BranchPerm, BranchSpec};
    use crate::union::types::LowerRef;

    fn fixture(n: usize) -> (TempDir, BranchTable, SideIo) {
        let tmp = TempDir::new().unwrap();
        let mut specs = Vec::new();
        for i in 0..n {
            let dir = tmp.path().join(format!("b{}", i));
            fs::create_dir_all(&dir).unwrap();
            specs.push(BranchSpec {
                root: dir,
                perms: if i == 0 {
                    BranchPerm::ReadWrite
                } else {
                    BranchPerm::ReadOnly
                },
            });
        }
        (tmp, BranchTable::new(specs).unwrap(), SideIo::spawn())
    }

    fn dir_fanout(table: &BranchTable, rel: &str, on: &[i32]) -> Fanout {
        let mut f = Fanout::new(table.len());
        for &b in on {
            let meta = fs::metadata(table.path_on(b, Path::new(rel))).unwrap();
            f.set_lower(
                b,
                LowerRef {
                    kind: FileType::Directory,
                    mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    ctime: SystemTime::UNIX_EPOCH,
                    nlink: 2,
                },
            );
        }
        f.set_start(on[0]);
        f.set_end(*on.last().unwrap());
        f
    }

    #[test]
    fn test_empty_dir_is_empty() {
        let (_tmp, table, _sioq) = fixture(2);
        for b in 0..2 {
            fs::create_dir(table.path_on(b, Path::new("d"))).unwrap();
        }
        let fanout = dir_fanout(&table, "d", &[0, 1]);
        let list = check_empty(&table, Path::new("d"), &fanout).unwrap();
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_real_entry_is_enotempty() {
        let (_tmp, table, _sioq) = fixture(2);
        for b in 0..2 {
            fs::create_dir(table.path_on(b, Path::new("d"))).unwrap();
        }
        fs::write(table.path_on(1, Path::new("d/y")), b"y").unwrap();

        let fanout = dir_fanout(&table, "d", &[0, 1]);
        assert_eq!(
            check_empty(&table, Path::new("d"), &fanout).unwrap_err(),
            libc::ENOTEMPTY
        );
    }

    #[test]
    fn test_whiteout_shadowed_entry_is_empty() {
        let (_tmp, table, sioq) = fixture(2);
        for b in 0..2 {
            fs::create_dir(table.path_on(b, Path::new("d"))).unwrap();
        }
        fs::write(table.path_on(1, Path::new("d/y")), b"y").unwrap();
        fs::write(table.path_on(0, Path::new("d/.wh.y")), b"").unwrap();

        let fanout = dir_fanout(&table, "d", &[0, 1]);
        let list = check_empty(&table, Path::new("d"), &fanout).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.branches(), vec![0]);

        delete_whiteouts(&table, &sioq, Path::new("d"), 0, &list).unwrap();
        assert!(!table.path_on(0, Path::new("d/.wh.y")).exists());
    }

    #[test]
    fn test_opacity_marker_does_not_count() {
        let (_tmp, table, _sioq) = fixture(1);
        fs::create_dir(table.path_on(0, Path::new("d"))).unwrap();
        fs::write(table.path_on(0, Path::new("d/.wh.__dir_opaque")), b"").unwrap();

        let fanout = dir_fanout(&table, "d", &[0]);
        let list = check_empty(&table, Path::new("d"), &fanout).unwrap();
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_scan_stops_at_opacity_bound() {
        let (_tmp, table, _sioq) = fixture(2);
        for b in 0..2 {
            fs::create_dir(table.path_on(b, Path::new("d"))).unwrap();
        }
        // Branch 1 holds a real entry, but branch 0's directory is opaque.
        fs::write(table.path_on(1, Path::new("d/deep")), b"x").unwrap();

        let mut fanout = dir_fanout(&table, "d", &[0, 1]);
        fanout.set_opaque(0);
        assert!(check_empty(&table, Path::new("d"), &fanout).is_ok());
    }

    #[test]
    fn test_duplicate_in_one_branch_is_eio() {
        let (_tmp, table, _sioq) = fixture(1);
        fs::create_dir(table.path_on(0, Path::new("d"))).unwrap();
        fs::write(table.path_on(0, Path::new("d/.wh.z")), b"").unwrap();
        fs::write(table.path_on(0, Path::new("d/z")), b"z").unwrap();

        let fanout = dir_fanout(&table, "d", &[0]);
        let err = check_empty(&table, Path::new("d"), &fanout).unwrap_err();
        // Depending on readdir order we catch the duplicate (EIO) or the
        // plain file first (ENOTEMPTY); either way rmdir must refuse.
        assert!(err == libc::EIO || err == libc::ENOTEMPTY);
    }
}
