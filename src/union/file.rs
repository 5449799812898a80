//! Open-file state: the per-handle stack of lower files and the readdir
//! snapshot addressed by the telldir cookie encoding.
//!
//! A handle remembers the branch ID each lower file was opened against, not
//! just its index. When branch management reshuffles the table, the IDs let
//! revalidation distinguish "my branch moved to a new position" (remap, no
//! reference counting change) from "my branch is gone or my top shifted"
//! (tear down and reopen).

use fuser::FileType;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fs::File;
use std::sync::Arc;

/// One merged directory snapshot, valid for the life of one cookie.
#[derive(Debug, Clone)]
pub(crate) struct DirState {
    pub cookie: u32,
    pub entries: Vec<DirEntrySnap>,
}

#[derive(Debug, Clone)]
pub(crate) struct DirEntrySnap {
    pub name: OsString,
    pub ino: u64,
    pub kind: FileType,
}

/// Per-open-handle record mapping one visible file to its lower files.
#[derive(Debug)]
pub(crate) struct UnionFile {
    pub ino: u64,
    /// Lower files indexed by branch position at open/reopen time. A
    /// directory holds one per populated branch; a regular file only the
    /// top slot.
    pub lowers: Vec<Option<Arc<Mutex<File>>>>,
    pub fstart: i32,
    pub fend: i32,
    /// Generation the handle was last (re)opened under.
    pub gen: u32,
    /// Branch ID active for each slot when it was opened.
    pub saved_branch_ids: Vec<u32>,
    /// Flags the caller opened with.
    pub flags: i32,
    /// Flags the top lower file was actually opened with; write bits may
    /// have been stripped off for a read-only branch, to be restored by a
    /// delayed copy-up.
    pub lower_flags: i32,
    pub rdstate: Option<DirState>,
}

impl UnionFile {
    pub fn new(ino: u64, nbranches: usize, flags: i32) -> Self {
        UnionFile {
            ino,
            lowers: new_lower_vec(nbranches),
            fstart: -1,
            fend: -1,
            gen: 0,
            saved_branch_ids: vec![0; nbranches],
            flags,
            lower_flags: flags,
            rdstate: None,
        }
    }

    pub fn lower(&self, b: i32) -> Option<Arc<Mutex<File>>> {
        usize::try_from(b)
            .ok()
            .and_then(|i| self.lowers.get(i))
            .and_then(|slot| slot.as_ref())
            .map(Arc::clone)
    }

    pub fn top(&self) -> Option<Arc<Mutex<File>>> {
        self.lower(self.fstart)
    }

    pub fn set_lower(&mut self, b: i32, file: File, branch_id: u32) {
        self.lowers[b as usize] = Some(Arc::new(Mutex::new(file)));
        self.saved_branch_ids[b as usize] = branch_id;
    }

    /// Slots currently holding a lower file, with their saved branch IDs.
    pub fn held_slots(&self) -> Vec<(i32, u32)> {
        self.lowers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| (i as i32, self.saved_branch_ids[i]))
            .collect()
    }

    /// Drop every lower file and resize for a possibly-changed branch
    /// count. Reference counting against the branch table is the caller's
    /// job; it knows the ID-to-index mapping that was current at open time.
    pub fn clear(&mut self, nbranches: usize) {
        self.lowers = new_lower_vec(nbranches);
        self.saved_branch_ids = vec![0; nbranches];
        self.fstart = -1;
        self.fend = -1;
        self.rdstate = None;
    }
}

fn new_lower_vec(nbranches: usize) -> Vec<Option<Arc<Mutex<File>>>> {
    let mut v = Vec::with_capacity(nbranches);
    v.resize_with(nbranches, || None);
    v
}

/// Will this open mutate the file? O_RDONLY is zero, so the access mode
/// needs masking rather than bit-testing.
pub(crate) fn is_write_flag(flags: i32) -> bool {
    (flags & libc::O_ACCMODE) != libc::O_RDONLY || (flags & libc::O_APPEND) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_write_flag() {
        assert!(!is_write_flag(libc::O_RDONLY));
        assert!(is_write_flag(libc::O_WRONLY));
        assert!(is_write_flag(libc::O_RDWR));
        assert!(is_write_flag(libc::O_RDONLY | libc::O_APPEND));
    }

    #[test]
    fn test_held_slots_tracks_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let f = File::open(tmp.path()).unwrap();
        let g = File::open(tmp.path()).unwrap();

        let mut uf = UnionFile::new(5, 3, libc::O_RDONLY);
        uf.set_lower(0, f, 11);
        uf.set_lower(2, g, 13);
        uf.fstart = 0;
        uf.fend = 2;

        assert_eq!(uf.held_slots(), vec![(0, 11), (2, 13)]);

        uf.clear(4);
        assert!(uf.held_slots().is_empty());
        assert_eq!(uf.lowers.len(), 4);
        assert_eq!(uf.fstart, -1);
    }
}
