//! The operation surface of the union: every `do_*` method here is one
//! externally-visible filesystem call, scripted from the lookup, copy-up
//! and revalidation engines.
//!
//! Mutations follow a common shape: revalidate, resolve the whiteout
//! situation at the starting branch, then walk leftward retrying on the
//! copy-up sentinel (EROFS from a read-only branch) until a branch accepts
//! the operation. A mutation that composes several lower steps and fails
//! midway leaves the fan-out observationally unchanged.

use fuser::{FileAttr, FileType, TimeOrNow};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::union::convert::{io_error_to_errno, is_copyup_err, metadata_to_fileattr};
use crate::union::copyup::{copyup_deleted_file, copyup_path, create_parents};
use crate::union::dirhelper::{check_empty, delete_whiteouts};
use crate::union::file::{is_write_flag, DirEntrySnap, DirState, UnionFile};
use crate::union::lookup::{lookup_fanout, lower_ref_of, LookupOutcome};
use crate::union::sioq::SideIoRequest;
use crate::union::types::{
    nlinks_for, offset_to_rdstate, rdstate_to_offset, Fanout, LookupMode, Node, DIR_EOF,
    IOCTL_INCGEN, IOCTL_QUERYFILE, QUERYFILE_MAX_BRANCHES,
};
use crate::union::whiteout::{is_valid_name, Whiteout, SILLY_PREFIX};
use crate::union::UnionFs;

/// Attribute changes requested by setattr, already narrowed to what the
/// union supports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetattrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

impl UnionFs {
    // ------------------------------------------------------------------
    // Lookup and attributes
    // ------------------------------------------------------------------

    pub fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        if !is_valid_name(name) {
            return Err(libc::EPERM);
        }
        self.revalidate_chain(parent)?;

        // Fast path: a cached child only needs its own revalidation.
        let cached = self.nodes.read().lookup_child(parent, name);
        if let Some(ino) = cached {
            match self.revalidate_chain(ino) {
                Ok(()) => {
                    let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
                    return Ok(node.attrs);
                }
                // Evicted as stale; fall through to a fresh lookup.
                Err(e) if e == libc::ESTALE => {}
                Err(e) => return Err(e),
            }
        }

        let pnode = self.node_snapshot(parent).ok_or(libc::ESTALE)?;
        if pnode.attrs.kind != FileType::Directory {
            return Err(libc::ENOTDIR);
        }

        let branches = self.branches.read();
        let outcome = lookup_fanout(
            &branches,
            &self.sioq,
            &pnode.path,
            &pnode.fanout,
            name,
            LookupMode::Lookup,
            None,
        )?;
        drop(branches);

        match outcome {
            LookupOutcome::Positive { fanout } => {
                self.interpose(parent, name, pnode.path.join(name), fanout, None)
            }
            LookupOutcome::Negative { .. } => Err(libc::ENOENT),
        }
    }

    pub fn do_getattr(&self, ino: u64) -> Result<FileAttr, i32> {
        self.revalidate_chain(ino)?;
        self.node_snapshot(ino).map(|n| n.attrs).ok_or(libc::ENOENT)
    }

    pub fn do_readlink(&self, ino: u64) -> Result<Vec<u8>, i32> {
        self.revalidate_chain(ino)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        if node.attrs.kind != FileType::Symlink {
            return Err(libc::EINVAL);
        }
        let branches = self.branches.read();
        let path = branches.path_on(node.fanout.start(), &node.path);
        let target = fs::read_link(&path).map_err(|e| io_error_to_errno(&e))?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    /// Wire a freshly built fan-out into the node table and hand back the
    /// visible attributes. `reuse` keeps an existing inode number across a
    /// positive re-lookup.
    pub(crate) fn interpose(
        &self,
        parent: u64,
        name: &OsStr,
        path: PathBuf,
        fanout: Fanout,
        reuse: Option<u64>,
    ) -> Result<FileAttr, i32> {
        let branches = self.branches.read();
        let top = fanout.start();
        debug_assert!(top >= 0, "interposing a negative fan-out");
        let meta = fs::symlink_metadata(branches.path_on(top, &path))
            .map_err(|e| io_error_to_errno(&e))?;
        drop(branches);

        let ino = reuse.unwrap_or_else(|| self.alloc_ino());
        let mut attrs = metadata_to_fileattr(&meta, ino);
        attrs.nlink = nlinks_for(attrs.kind, &fanout);
        fanout.assert_consistent(Some(attrs.kind));

        self.nodes.write().insert(Node {
            ino,
            parent,
            name: name.to_os_string(),
            path,
            fanout,
            attrs,
            gen: self.sbgen(),
            stale: false,
            totalopens: 0,
            deleted: false,
        });
        Ok(attrs)
    }

    // ------------------------------------------------------------------
    // Copy-up driver
    // ------------------------------------------------------------------

    /// Promote the object to the nearest writable branch to the left of
    /// its current top. A no-op when the top branch is already writable.
    /// `len` caps the bytes copied for regular files.
    pub(crate) fn copyup_node(&self, ino: u64, len: Option<u64>) -> Result<(), i32> {
        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        let src = node.fanout.start();
        if src < 0 {
            return Err(libc::EINVAL);
        }

        let branches = self.branches.read();
        if !branches.is_robranch(src) {
            return Ok(());
        }

        let mut last_err = libc::EROFS;
        for dst in (0..src).rev() {
            if branches.is_robranch(dst) {
                continue;
            }

            let result = if node.deleted {
                copyup_deleted_file(&branches, &self.sioq, &node.path, src, dst, len)
                    .map(|(name, meta)| (Some(name), meta))
            } else {
                copyup_path(&branches, &self.sioq, &node.path, &node.path, src, dst, len)
                    .map(|meta| (None, meta))
            };

            match result {
                Ok((silly, meta)) => {
                    drop(branches);
                    let mut nodes = self.nodes.write();
                    if let Some(n) = nodes.get_mut(ino) {
                        if let Some(new_name) = silly {
                            n.path = n
                                .path
                                .parent()
                                .unwrap_or(Path::new(""))
                                .join(&new_name);
                            n.name = new_name;
                        }
                        n.fanout.set_lower(dst, lower_ref_of(&meta));
                        if n.attrs.kind == FileType::Directory {
                            n.fanout.set_start(dst);
                        } else {
                            n.fanout.collapse_to(dst);
                        }
                        let kind = n.attrs.kind;
                        n.attrs = metadata_to_fileattr(&meta, ino);
                        n.attrs.nlink = nlinks_for(kind, &n.fanout);
                    }
                    tracing::debug!("copied up ino {} from {} to {}", ino, src, dst);
                    return Ok(());
                }
                Err(e) if is_copyup_err(e) => {
                    last_err = e;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    // ------------------------------------------------------------------
    // Creation family
    // ------------------------------------------------------------------

    /// Shared mutation preamble: name checks, parent revalidation, and the
    /// branch scan proving the name free. Returns the parent node and the
    /// branch a create should start from.
    fn prepare_create(&self, parent: u64, name: &OsStr) -> Result<(Node, i32), i32> {
        if !is_valid_name(name) {
            return Err(libc::EPERM);
        }
        self.revalidate_chain(parent)?;
        let pnode = self.node_snapshot(parent).ok_or(libc::ESTALE)?;
        if pnode.attrs.kind != FileType::Directory {
            return Err(libc::ENOTDIR);
        }

        let branches = self.branches.read();
        let outcome = lookup_fanout(
            &branches,
            &self.sioq,
            &pnode.path,
            &pnode.fanout,
            name,
            LookupMode::Default,
            None,
        )?;
        match outcome {
            LookupOutcome::Positive { .. } => Err(libc::EEXIST),
            LookupOutcome::Negative { slot } => Ok((pnode, slot)),
        }
    }

    /// Remove a whiteout standing where a create wants to land. Shifts the
    /// starting branch leftward instead when that branch cannot be written.
    fn unlink_whiteout_for_create(
        &self,
        pnode: &Node,
        name: &OsStr,
        bstart: &mut i32,
    ) -> Result<(), i32> {
        let branches = self.branches.read();
        let marker = Whiteout::marker_path(&branches.path_on(*bstart, &pnode.path), name);
        match fs::symlink_metadata(&marker) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error_to_errno(&e)),
            Ok(_) => {}
        }
        if branches.is_robranch(*bstart) {
            *bstart -= 1;
            return Ok(());
        }
        drop(branches);
        self.sioq.submit(SideIoRequest::Unlink { path: marker })?;
        Ok(())
    }

    /// The leftward creation loop shared by mkdir/symlink/mknod and the
    /// non-whiteout half of create. `op` performs the branch primitive at
    /// the would-be path.
    fn create_leftward<F>(
        &self,
        pnode: &Node,
        name: &OsStr,
        bstart: i32,
        op: F,
    ) -> Result<i32, i32>
    where
        F: Fn(&Path) -> Result<(), i32>,
    {
        let branches = self.branches.read();
        let child_rel = pnode.path.join(name);
        let mut last_err = libc::EROFS;

        for bindex in (0..=bstart).rev() {
            if branches.is_robranch(bindex) {
                continue;
            }
            if pnode.path != Path::new("") {
                if let Err(e) =
                    create_parents(&branches, &pnode.path, pnode.fanout.start(), bindex)
                {
                    tracing::debug!("create_parents failed on branch {}: {}", bindex, e);
                    last_err = e;
                    continue;
                }
            }
            match op(&branches.path_on(bindex, &child_rel)) {
                Ok(()) => return Ok(bindex),
                Err(e) if is_copyup_err(e) => {
                    last_err = e;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn single_slot_fanout(&self, bindex: i32, rel: &Path) -> Result<Fanout, i32> {
        let branches = self.branches.read();
        let meta = fs::symlink_metadata(branches.path_on(bindex, rel))
            .map_err(|e| io_error_to_errno(&e))?;
        let mut fanout = Fanout::new(branches.len());
        fanout.set_lower(bindex, lower_ref_of(&meta));
        fanout.set_start(bindex);
        fanout.set_end(bindex);
        Ok(fanout)
    }

    pub fn do_create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64), i32> {
        let lock = self.node_lock(parent);
        let _guard = lock.lock();

        let (pnode, mut bstart) = self.prepare_create(parent, name)?;
        let child_rel = pnode.path.join(name);
        let perm_mode = mode & 0o7777;

        // A whiteout at the target branch is truncated and renamed into
        // place: one atomic replacement of the marker by the new file.
        let mut created_at: Option<i32> = None;
        {
            let branches = self.branches.read();
            if bstart >= 0 && !branches.is_robranch(bstart) {
                let parent_dir = branches.path_on(bstart, &pnode.path);
                let marker = Whiteout::marker_path(&parent_dir, name);
                if marker.exists() {
                    let file = OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .open(&marker)
                        .map_err(|e| io_error_to_errno(&e))?;
                    file.set_permissions(fs::Permissions::from_mode(perm_mode))
                        .map_err(|e| io_error_to_errno(&e))?;
                    drop(file);
                    fs::rename(&marker, branches.path_on(bstart, &child_rel))
                        .map_err(|e| io_error_to_errno(&e))?;
                    created_at = Some(bstart);
                }
            } else if bstart >= 0 && branches.is_robranch(bstart) {
                let marker =
                    Whiteout::marker_path(&branches.path_on(bstart, &pnode.path), name);
                if marker.exists() {
                    // Cannot reuse a whiteout on a read-only branch; move
                    // the starting point one branch left.
                    bstart -= 1;
                }
            }
        }

        let bindex = match created_at {
            Some(b) => b,
            None => self.create_leftward(&pnode, name, bstart, |path| {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(perm_mode)
                    .open(path)
                    .map(|_| ())
                    .map_err(|e| io_error_to_errno(&e))
            })?,
        };

        let fanout = self.single_slot_fanout(bindex, &child_rel)?;
        let attrs = self.interpose(parent, name, child_rel.clone(), fanout, None)?;
        let _ = self.refresh_attrs(parent);

        // Hand back an open handle, as the host's atomic create expects.
        // The file was created empty just now; truncating again is noise.
        let open_flags = (flags & !libc::O_ACCMODE & !libc::O_TRUNC) | libc::O_RDWR;
        let fh = self.open_file_handle(attrs.ino, open_flags)?;
        Ok((attrs, fh))
    }

    pub fn do_mkdir(&self, parent: u64, name: &OsStr, mode: u32) -> Result<FileAttr, i32> {
        let lock = self.node_lock(parent);
        let _guard = lock.lock();

        let (pnode, mut bstart) = self.prepare_create(parent, name)?;
        self.unlink_whiteout_for_create(&pnode, name, &mut bstart)?;

        let perm_mode = mode & 0o7777;
        let bindex = self.create_leftward(&pnode, name, bstart, |path| {
            fs::create_dir(path).map_err(|e| io_error_to_errno(&e))?;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(perm_mode));
            Ok(())
        })?;

        let child_rel = pnode.path.join(name);
        let mut fanout = self.single_slot_fanout(bindex, &child_rel)?;

        // A new directory must not expose contents a whiteout was hiding
        // below it, so it is born opaque.
        {
            let branches = self.branches.read();
            let marker = Whiteout::opaque_path(&branches.path_on(bindex, &child_rel));
            drop(branches);
            match self.sioq.submit(SideIoRequest::Create {
                path: marker,
                mode: 0o444,
            }) {
                Ok(_) => fanout.set_opaque(bindex),
                Err(e) if e == libc::EEXIST => fanout.set_opaque(bindex),
                Err(e) => {
                    tracing::error!("mkdir: cannot make {:?} opaque: {}", child_rel, e);
                    return Err(e);
                }
            }
        }

        let attrs = self.interpose(parent, name, child_rel, fanout, None)?;
        let _ = self.refresh_attrs(parent);
        Ok(attrs)
    }

    pub fn do_symlink(
        &self,
        parent: u64,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileAttr, i32> {
        let lock = self.node_lock(parent);
        let _guard = lock.lock();

        let (pnode, mut bstart) = self.prepare_create(parent, name)?;
        self.unlink_whiteout_for_create(&pnode, name, &mut bstart)?;

        let bindex = self.create_leftward(&pnode, name, bstart, |path| {
            std::os::unix::fs::symlink(target, path).map_err(|e| io_error_to_errno(&e))
        })?;

        let child_rel = pnode.path.join(name);
        let fanout = self.single_slot_fanout(bindex, &child_rel)?;
        let attrs = self.interpose(parent, name, child_rel, fanout, None)?;
        let _ = self.refresh_attrs(parent);
        Ok(attrs)
    }

    pub fn do_mknod(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<FileAttr, i32> {
        use nix::sys::stat::{mknod, Mode, SFlag};

        let lock = self.node_lock(parent);
        let _guard = lock.lock();

        let (pnode, mut bstart) = self.prepare_create(parent, name)?;
        self.unlink_whiteout_for_create(&pnode, name, &mut bstart)?;

        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        let bindex = self.create_leftward(&pnode, name, bstart, |path| {
            mknod(path, kind, perm, rdev as nix::libc::dev_t)
                .map_err(|e| e as i32)
        })?;

        let child_rel = pnode.path.join(name);
        let fanout = self.single_slot_fanout(bindex, &child_rel)?;
        let attrs = self.interpose(parent, name, child_rel, fanout, None)?;
        let _ = self.refresh_attrs(parent);
        Ok(attrs)
    }

    // ------------------------------------------------------------------
    // Removal family
    // ------------------------------------------------------------------

    /// Resolve an existing child, revalidated, or fail with ENOENT.
    fn resolve_child(&self, parent: u64, name: &OsStr) -> Result<u64, i32> {
        let attrs = self.do_lookup(parent, name)?;
        Ok(attrs.ino)
    }

    /// Is `name` present on any branch strictly below `below`, within the
    /// parent's bounds? Whiteouts count as absence: they already hide
    /// whatever sits deeper.
    fn lower_has_name(&self, pnode: &Node, name: &OsStr, below: i32) -> bool {
        let branches = self.branches.read();
        let mut bend = pnode.fanout.end();
        if pnode.fanout.opaque() >= 0 && pnode.fanout.opaque() < bend {
            bend = pnode.fanout.opaque();
        }
        for b in (below + 1)..=bend {
            if pnode.fanout.lower(b).is_none() {
                continue;
            }
            let dir = branches.path_on(b, &pnode.path);
            if Whiteout::marker_path(&dir, name).exists() {
                return false;
            }
            if dir.join(name).symlink_metadata().is_ok() {
                return true;
            }
        }
        false
    }

    /// Install a whiteout for `name`, starting at `start` and walking left
    /// past read-only branches. Returns the branch that took it.
    fn create_whiteout_from(&self, pnode: &Node, name: &OsStr, start: i32) -> Result<i32, i32> {
        let branches = self.branches.read();
        let mut last_err = libc::EROFS;

        for bindex in (0..=start).rev() {
            if branches.is_robranch(bindex) {
                continue;
            }
            if pnode.path != Path::new("") {
                if let Err(e) =
                    create_parents(&branches, &pnode.path, pnode.fanout.start(), bindex)
                {
                    last_err = e;
                    continue;
                }
            }
            let marker = Whiteout::marker_path(&branches.path_on(bindex, &pnode.path), name);
            match fs::symlink_metadata(&marker) {
                // Already whited out here; possible under opacity churn.
                Ok(_) => return Ok(bindex),
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(io_error_to_errno(&e))
                }
                Err(_) => {}
            }
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&marker)
            {
                Ok(_) => return Ok(bindex),
                Err(e) => {
                    let errno = io_error_to_errno(&e);
                    if is_copyup_err(errno) {
                        last_err = errno;
                        continue;
                    }
                    return Err(errno);
                }
            }
        }
        Err(last_err)
    }

    pub fn do_unlink(&self, parent: u64, name: &OsStr) -> Result<(), i32> {
        let ino = self.resolve_child(parent, name)?;
        let (plock, clock) = self.node_lock_pair(parent, ino);
        let _pguard = plock.lock();
        let _cguard = clock.lock();

        let pnode = self.node_snapshot(parent).ok_or(libc::ESTALE)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        if node.attrs.kind == FileType::Directory {
            return Err(libc::EISDIR);
        }

        // The victim path comes from the name being unlinked, not from the
        // node: a hard-linked node remembers only one of its names.
        let victim_rel = pnode.path.join(name);
        let bstart = node.fanout.start();

        // Physical removal happens only on the top branch. An occurrence
        // on any deeper branch is left in place and hidden by a whiteout
        // above it, so lower branches are never destroyed by the union.
        if bstart == 0 {
            let branches = self.branches.read();
            match fs::remove_file(branches.path_on(bstart, &victim_rel)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                // EROFS on branch 0 is surfaced, never retried.
                Err(e) => return Err(io_error_to_errno(&e)),
            }
            drop(branches);
            if self.lower_has_name(&pnode, name, bstart) {
                self.create_whiteout_from(&pnode, name, bstart)?;
            }
        } else {
            self.create_whiteout_from(&pnode, name, bstart - 1)?;
        }

        {
            let mut nodes = self.nodes.write();
            nodes.remove_child(parent, name);
            let mut drop_node = false;
            if let Some(n) = nodes.get_mut(ino) {
                if n.path == victim_rel {
                    if n.totalopens > 0 {
                        // Open handles keep the node; delayed copy-up will
                        // silly-rename it if it must move branches.
                        n.deleted = true;
                    } else {
                        drop_node = true;
                    }
                } else {
                    // Unlinked one alias of a hard link.
                    n.attrs.nlink = n.attrs.nlink.saturating_sub(1);
                }
            }
            if drop_node {
                nodes.remove(ino);
            }
        }
        self.drop_node_lock_if_gone(ino);
        let _ = self.refresh_attrs(parent);
        Ok(())
    }

    pub fn do_rmdir(&self, parent: u64, name: &OsStr) -> Result<(), i32> {
        let ino = self.resolve_child(parent, name)?;
        let (plock, clock) = self.node_lock_pair(parent, ino);
        let _pguard = plock.lock();
        let _cguard = clock.lock();

        let pnode = self.node_snapshot(parent).ok_or(libc::ESTALE)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        if node.attrs.kind != FileType::Directory {
            return Err(libc::ENOTDIR);
        }

        // Fill every candidate branch before judging emptiness.
        let branches = self.branches.read();
        let fanout = match lookup_fanout(
            &branches,
            &self.sioq,
            &pnode.path,
            &pnode.fanout,
            name,
            LookupMode::Partial,
            Some(node.fanout.clone()),
        )? {
            LookupOutcome::Positive { fanout } => fanout,
            LookupOutcome::Negative { .. } => return Err(libc::ENOENT),
        };

        let namelist = check_empty(&branches, &node.path, &fanout)?;

        // Like unlink: only a top-branch directory is physically removed;
        // a deeper one survives behind a whiteout.
        let bstart = fanout.start();
        if bstart == 0 {
            delete_whiteouts(&branches, &self.sioq, &node.path, bstart, &namelist)?;

            // The opacity marker, if any, would keep the lower rmdir from
            // succeeding; it is ours, so clear it.
            let dir_abs = branches.path_on(bstart, &node.path);
            let opaque_marker = Whiteout::opaque_path(&dir_abs);
            if opaque_marker.exists() {
                fs::remove_file(&opaque_marker).map_err(|e| io_error_to_errno(&e))?;
            }

            fs::remove_dir(&dir_abs).map_err(|e| io_error_to_errno(&e))?;
            drop(branches);

            if self.lower_has_name(&pnode, name, bstart) {
                self.create_whiteout_from(&pnode, name, bstart)?;
            }
        } else {
            drop(branches);
            self.create_whiteout_from(&pnode, name, bstart - 1)?;
        }

        self.nodes.write().remove(ino);
        self.drop_node_lock(ino);
        let _ = self.refresh_attrs(parent);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rename and link
    // ------------------------------------------------------------------

    pub fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<(), i32> {
        if !is_valid_name(name) || !is_valid_name(newname) {
            return Err(libc::EPERM);
        }

        let src_ino = self.resolve_child(parent, name)?;

        // An existing destination is removed first, with its own rules.
        match self.do_lookup(newparent, newname) {
            Ok(dst_attrs) => {
                if dst_attrs.ino == src_ino {
                    return Ok(());
                }
                if dst_attrs.kind == FileType::Directory {
                    self.do_rmdir(newparent, newname)?;
                } else {
                    self.do_unlink(newparent, newname)?;
                }
            }
            Err(e) if e == libc::ENOENT => {}
            Err(e) => return Err(e),
        }

        let (first, second) = self.node_lock_pair(src_ino, newparent);
        let _g1 = first.lock();
        let _g2 = second.lock();

        // Cross-branch rename is copy-up-then-rename. Copy-up moves one
        // object, so a directory that fans out (or sits on a read-only
        // branch) cannot be renamed wholesale; EXDEV makes the caller
        // fall back to a recursive copy.
        {
            let node = self.node_snapshot(src_ino).ok_or(libc::ESTALE)?;
            let branches = self.branches.read();
            let is_ro = branches.is_robranch(node.fanout.start());
            drop(branches);
            if node.attrs.kind == FileType::Directory {
                if is_ro || node.fanout.end() > node.fanout.start() {
                    return Err(libc::EXDEV);
                }
            } else if is_ro {
                self.copyup_node(src_ino, None)?;
            }
        }

        let pnode = self.node_snapshot(parent).ok_or(libc::ESTALE)?;
        let npnode = self.node_snapshot(newparent).ok_or(libc::ESTALE)?;
        let node = self.node_snapshot(src_ino).ok_or(libc::ESTALE)?;
        let b = node.fanout.start();
        let new_rel = npnode.path.join(newname);

        {
            let branches = self.branches.read();
            if branches.is_robranch(b) {
                return Err(libc::EROFS);
            }
            if npnode.path != Path::new("") {
                create_parents(&branches, &npnode.path, npnode.fanout.start(), b)?;
            }

            // A stale whiteout at the destination must not outlive the
            // object that replaces it.
            let marker = Whiteout::marker_path(&branches.path_on(b, &npnode.path), newname);
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error_to_errno(&e)),
            }

            fs::rename(
                branches.path_on(b, &node.path),
                branches.path_on(b, &new_rel),
            )
            .map_err(|e| io_error_to_errno(&e))?;
        }

        if self.lower_has_name(&pnode, name, b) {
            self.create_whiteout_from(&pnode, name, b)?;
        }

        {
            let mut nodes = self.nodes.write();
            nodes.remove_child(parent, name);
            nodes.add_child(newparent, newname, src_ino);
            if let Some(n) = nodes.get_mut(src_ino) {
                n.parent = newparent;
                n.name = newname.to_os_string();
                n.path = new_rel;
            }
        }

        // Children of a renamed directory carry cached paths under the old
        // name; the generation bump makes them re-resolve lazily.
        if node.attrs.kind == FileType::Directory {
            self.generation
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        let _ = self.refresh_attrs(parent);
        let _ = self.refresh_attrs(newparent);
        Ok(())
    }

    pub fn do_link(&self, ino: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr, i32> {
        if !is_valid_name(newname) {
            return Err(libc::EPERM);
        }
        self.revalidate_chain(ino)?;
        self.revalidate_chain(newparent)?;

        match self.do_lookup(newparent, newname) {
            Ok(_) => return Err(libc::EEXIST),
            Err(e) if e == libc::ENOENT => {}
            Err(e) => return Err(e),
        }

        let (first, second) = self.node_lock_pair(ino, newparent);
        let _g1 = first.lock();
        let _g2 = second.lock();

        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        if node.attrs.kind == FileType::Directory {
            return Err(libc::EPERM);
        }

        // Hard links cannot span branches; promote the source first.
        {
            let branches = self.branches.read();
            let is_ro = branches.is_robranch(node.fanout.start());
            drop(branches);
            if is_ro {
                self.copyup_node(ino, None)?;
            }
        }

        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        let npnode = self.node_snapshot(newparent).ok_or(libc::ESTALE)?;
        let b = node.fanout.start();
        let new_rel = npnode.path.join(newname);

        {
            let branches = self.branches.read();
            if branches.is_robranch(b) {
                return Err(libc::EROFS);
            }
            if npnode.path != Path::new("") {
                create_parents(&branches, &npnode.path, npnode.fanout.start(), b)?;
            }
            let marker = Whiteout::marker_path(&branches.path_on(b, &npnode.path), newname);
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error_to_errno(&e)),
            }

            fs::hard_link(
                branches.path_on(b, &node.path),
                branches.path_on(b, &new_rel),
            )
            .map_err(|e| io_error_to_errno(&e))?;
        }

        self.nodes.write().add_child(newparent, newname, ino);
        let _ = self.refresh_attrs(ino);
        let _ = self.refresh_attrs(newparent);
        self.node_snapshot(ino).map(|n| n.attrs).ok_or(libc::ESTALE)
    }

    // ------------------------------------------------------------------
    // setattr / access
    // ------------------------------------------------------------------

    pub fn do_setattr(&self, ino: u64, request: SetattrRequest) -> Result<FileAttr, i32> {
        self.revalidate_chain(ino)?;
        let lock = self.node_lock(ino);
        let _guard = lock.lock();

        // Writing attributes to a read-only top means copy-up first; the
        // truncation size caps how much gets copied.
        {
            let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
            let branches = self.branches.read();
            let is_ro = branches.is_robranch(node.fanout.start());
            drop(branches);
            if is_ro {
                self.copyup_node(ino, request.size)?;
            }
        }

        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        let branches = self.branches.read();
        let path = branches.path_on(node.fanout.start(), &node.path);
        drop(branches);

        if let Some(size) = request.size {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| io_error_to_errno(&e))?;
            file.set_len(size).map_err(|e| io_error_to_errno(&e))?;
        }
        if let Some(mode) = request.mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| io_error_to_errno(&e))?;
        }
        if request.uid.is_some() || request.gid.is_some() {
            use nix::unistd::{chown, Gid, Uid};
            chown(
                &path,
                request.uid.map(Uid::from_raw),
                request.gid.map(Gid::from_raw),
            )
            .map_err(|e| e as i32)?;
        }
        if request.atime.is_some() || request.mtime.is_some() {
            use nix::sys::stat::utimes;
            use nix::sys::time::TimeVal;

            // A side the caller left out keeps its current value.
            let to_val = |t: Option<TimeOrNow>, current: SystemTime| -> TimeVal {
                let st = match t {
                    None => current,
                    Some(TimeOrNow::Now) => SystemTime::now(),
                    Some(TimeOrNow::SpecificTime(st)) => st,
                };
                let d = st
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default();
                TimeVal::new(d.as_secs() as _, d.subsec_micros() as _)
            };
            utimes(
                &path,
                &to_val(request.atime, node.attrs.atime),
                &to_val(request.mtime, node.attrs.mtime),
            )
            .map_err(|e| e as i32)?;
        }

        self.refresh_attrs(ino)?;
        self.node_snapshot(ino).map(|n| n.attrs).ok_or(libc::ESTALE)
    }

    pub fn do_access(&self, ino: u64, mask: i32, uid: u32, gid: u32) -> Result<(), i32> {
        self.revalidate_chain(ino)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        if mask == libc::F_OK {
            return Ok(());
        }

        let is_file = node.attrs.kind != FileType::Directory;
        let write_mask = mask & libc::W_OK != 0;
        let branches = self.branches.read();

        for b in node.fanout.populated() {
            let lref = node.fanout.lower(b).unwrap();
            if !is_file && lref.kind != FileType::Directory {
                continue;
            }

            if write_mask && branches.is_robranch(b) {
                if b == 0 {
                    // The top branch is allowed to be really read-only.
                    return Err(libc::EROFS);
                }
                // Deeper read-only branches are ignored so the caller can
                // copy up.
                if is_file {
                    break;
                }
                continue;
            }

            let meta = fs::symlink_metadata(branches.path_on(b, &node.path))
                .map_err(|e| io_error_to_errno(&e))?;
            check_unix_access(&meta, mask, uid, gid)?;

            // Only the leftmost object matters for files and for writes.
            if is_file || write_mask {
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Open files
    // ------------------------------------------------------------------

    fn open_lower_file(
        &self,
        uf: &mut UnionFile,
        node: &Node,
        flags: i32,
    ) -> Result<(), i32> {
        let branches = self.branches.read();
        let bstart = node.fanout.start();
        let mut effective = flags;

        if branches.is_robranch(bstart) && is_write_flag(flags) {
            // Defer the promotion to the first actual write.
            effective = (flags & !libc::O_ACCMODE & !libc::O_APPEND) | libc::O_RDONLY;
        }

        let path = branches.path_on(bstart, &node.path);
        let write = is_write_flag(effective);
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .append(write && (effective & libc::O_APPEND != 0))
            .truncate(write && (flags & libc::O_TRUNC != 0))
            .open(&path)
            .map_err(|e| io_error_to_errno(&e))?;

        branches.branchget(bstart);
        uf.set_lower(bstart, file, branches.branch(bstart).id);
        uf.fstart = bstart;
        uf.fend = bstart;
        uf.lower_flags = effective;
        Ok(())
    }

    fn open_lower_dirs(&self, uf: &mut UnionFile, node: &Node) -> Result<(), i32> {
        let branches = self.branches.read();
        let mut fstart = -1;
        let mut fend = -1;

        for b in node.fanout.populated() {
            if node.fanout.lower(b).unwrap().kind != FileType::Directory {
                continue;
            }
            let path = branches.path_on(b, &node.path);
            let file = fs::File::open(&path).map_err(|e| io_error_to_errno(&e))?;
            branches.branchget(b);
            uf.set_lower(b, file, branches.branch(b).id);
            if fstart < 0 {
                fstart = b;
            }
            fend = b;
        }

        uf.fstart = fstart;
        uf.fend = fend;
        Ok(())
    }

    fn release_lower_files(&self, uf: &mut UnionFile, nbranches: usize) {
        let branches = self.branches.read();
        for (_, id) in uf.held_slots() {
            match branches.branch_id_to_index(id) {
                Some(idx) => branches.branchput(idx),
                // Refcounted branches cannot be removed while held; an
                // unmapped ID here is a bookkeeping bug.
                None => tracing::warn!("open file held vanished branch id {}", id),
            }
        }
        drop(branches);
        uf.clear(nbranches);
    }

    fn open_file_handle(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        self.revalidate_chain(ino)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;

        // O_TRUNC on a read-only top cannot be deferred: promote now with
        // a zero-byte cap, nothing of the old content survives anyway.
        {
            let branches = self.branches.read();
            let needs_trunc_copyup = branches.is_robranch(node.fanout.start())
                && is_write_flag(flags)
                && (flags & libc::O_TRUNC != 0);
            drop(branches);
            if needs_trunc_copyup {
                self.copyup_node(ino, Some(0))?;
            }
        }

        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        let nbranches = self.branches.read().len();
        let mut uf = UnionFile::new(ino, nbranches, flags);
        uf.gen = node.gen;

        if node.attrs.kind == FileType::Directory {
            self.open_lower_dirs(&mut uf, &node)?;
        } else {
            self.open_lower_file(&mut uf, &node, flags)?;
        }

        {
            let mut nodes = self.nodes.write();
            if let Some(n) = nodes.get_mut(ino) {
                n.totalopens += 1;
            }
        }

        let fh = self.alloc_fh();
        self.files.write().insert(fh, Arc::new(Mutex::new(uf)));
        Ok(fh)
    }

    pub fn do_open(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let lock = self.node_lock(ino);
        let _guard = lock.lock();
        self.open_file_handle(ino, flags)
    }

    pub fn do_opendir(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let lock = self.node_lock(ino);
        let _guard = lock.lock();
        self.open_file_handle(ino, flags & !libc::O_ACCMODE)
    }

    /// Bring an open handle in line with the current branch layout, and
    /// perform the delayed copy-up when the caller is about to write
    /// through a handle that was opened read-only on a read-only branch.
    pub(crate) fn file_revalidate(
        &self,
        ino: u64,
        fh: u64,
        willwrite: bool,
    ) -> Result<Arc<Mutex<UnionFile>>, i32> {
        self.revalidate_chain(ino)?;
        let file_arc = self
            .files
            .read()
            .get(&fh)
            .cloned()
            .ok_or(libc::EBADF)?;

        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        if node.stale {
            // Raced with an eviction; the host must re-lookup the name.
            return Err(libc::ESTALE);
        }
        let sbgen = self.sbgen();
        let mut uf = file_arc.lock();

        if !node.deleted && (sbgen > uf.gen || node.fanout.start() != uf.fstart) {
            tracing::debug!(
                "reopening fh {} of ino {} (gen {} -> {}, slots {}..{} -> top {})",
                fh,
                uf.ino,
                uf.gen,
                sbgen,
                uf.fstart,
                uf.fend,
                node.fanout.start()
            );
            let nbranches = self.branches.read().len();
            self.release_lower_files(&mut uf, nbranches);
            if node.attrs.kind == FileType::Directory {
                self.open_lower_dirs(&mut uf, &node)?;
            } else {
                let flags = uf.flags;
                self.open_lower_file(&mut uf, &node, flags)?;
            }
            uf.gen = node.gen;
        }

        if willwrite && is_write_flag(uf.flags) && !is_write_flag(uf.lower_flags) {
            let needs = {
                let branches = self.branches.read();
                branches.is_robranch(node.fanout.start())
            };
            if needs {
                tracing::debug!("delayed copy-up of ino {} on first write", ino);
                self.copyup_node(ino, None)?;
                let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
                let nbranches = self.branches.read().len();
                self.release_lower_files(&mut uf, nbranches);
                let flags = uf.flags;
                self.open_lower_file(&mut uf, &node, flags)?;
                uf.gen = node.gen;
            }
        }

        drop(uf);
        Ok(file_arc)
    }

    pub fn do_read(&self, ino: u64, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let file_arc = self.file_revalidate(ino, fh, false)?;
        let top = {
            let uf = file_arc.lock();
            uf.top().ok_or(libc::EBADF)?
        };

        let mut file = top.lock();
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| io_error_to_errno(&e))?;

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_error_to_errno(&e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn do_write(&self, ino: u64, fh: u64, offset: i64, data: &[u8]) -> Result<u32, i32> {
        let file_arc = self.file_revalidate(ino, fh, true)?;
        let top = {
            let uf = file_arc.lock();
            uf.top().ok_or(libc::EBADF)?
        };

        let mut file = top.lock();
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| io_error_to_errno(&e))?;
        file.write_all(data).map_err(|e| io_error_to_errno(&e))?;

        // Size and times become visible only now that the lower write has
        // succeeded.
        if let Ok(meta) = file.metadata() {
            drop(file);
            let mut nodes = self.nodes.write();
            if let Some(n) = nodes.get_mut(ino) {
                let ino_keep = n.attrs.ino;
                let nlink_keep = n.attrs.nlink;
                n.attrs = metadata_to_fileattr(&meta, ino_keep);
                n.attrs.nlink = nlink_keep;
                let top_b = n.fanout.start();
                if top_b >= 0 {
                    n.fanout.set_lower(top_b, lower_ref_of(&meta));
                }
            }
        }
        Ok(data.len() as u32)
    }

    pub fn do_flush(&self, ino: u64, fh: u64) -> Result<(), i32> {
        let file_arc = self.file_revalidate(ino, fh, false)?;
        let uf = file_arc.lock();
        if let Some(top) = uf.top() {
            drop(uf);
            if let Ok(meta) = top.lock().metadata() {
                let mut nodes = self.nodes.write();
                if let Some(n) = nodes.get_mut(ino) {
                    if n.attrs.kind != FileType::Directory {
                        let ino_keep = n.attrs.ino;
                        let nlink_keep = n.attrs.nlink;
                        n.attrs = metadata_to_fileattr(&meta, ino_keep);
                        n.attrs.nlink = nlink_keep;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn do_fsync(&self, ino: u64, fh: u64, datasync: bool) -> Result<(), i32> {
        let file_arc = self.file_revalidate(ino, fh, false)?;
        let uf = file_arc.lock();
        let top = uf.top().ok_or(libc::EBADF)?;
        drop(uf);
        let file = top.lock();
        if datasync {
            file.sync_data().map_err(|e| io_error_to_errno(&e))
        } else {
            file.sync_all().map_err(|e| io_error_to_errno(&e))
        }
    }

    pub fn do_release(&self, ino: u64, fh: u64) -> Result<(), i32> {
        let file_arc = self.files.write().remove(&fh).ok_or(libc::EBADF)?;
        let mut uf = file_arc.lock();
        let nbranches = self.branches.read().len();
        self.release_lower_files(&mut uf, nbranches);
        drop(uf);

        let mut cleanup: Option<(i32, PathBuf)> = None;
        {
            let mut nodes = self.nodes.write();
            let mut drop_node = false;
            if let Some(n) = nodes.get_mut(ino) {
                n.totalopens = n.totalopens.saturating_sub(1);
                if n.deleted && n.totalopens == 0 {
                    // A silly-renamed promotion loses its last reference
                    // with this close; remove the on-branch remnant.
                    if n.name.as_bytes().starts_with(SILLY_PREFIX.as_bytes()) {
                        cleanup = Some((n.fanout.start(), n.path.clone()));
                    }
                    drop_node = true;
                }
            }
            if drop_node {
                nodes.remove(ino);
            }
        }

        if let Some((b, path)) = cleanup {
            let branches = self.branches.read();
            if b >= 0 {
                if let Err(e) = fs::remove_file(branches.path_on(b, &path)) {
                    tracing::warn!("failed to reap silly-renamed {:?}: {}", path, e);
                }
            }
        }
        self.drop_node_lock_if_gone(ino);
        Ok(())
    }

    pub(crate) fn drop_node_lock_if_gone(&self, ino: u64) {
        let gone = self.nodes.read().peek(ino).is_none();
        if gone {
            self.drop_node_lock(ino);
        }
    }

    // ------------------------------------------------------------------
    // readdir
    // ------------------------------------------------------------------

    /// Merge the directory across its populated branches, top priority
    /// first. Whiteouts hide the same name on deeper branches (and their
    /// own); the opacity bound stops the descent.
    fn build_dir_snapshot(&self, node: &Node) -> Result<Vec<DirEntrySnap>, i32> {
        struct Merged {
            name: OsString,
            kind: FileType,
        }

        let mut merged: Vec<Merged> = Vec::new();
        let mut taken: HashSet<OsString> = HashSet::new();
        let mut hidden: HashSet<OsString> = HashSet::new();

        {
            let branches = self.branches.read();
            let mut bend = node.fanout.end();
            if node.fanout.opaque() >= 0 && node.fanout.opaque() < bend {
                bend = node.fanout.opaque();
            }

            for b in node.fanout.start()..=bend {
                match node.fanout.lower(b) {
                    Some(l) if l.kind == FileType::Directory => {}
                    _ => continue,
                }
                let dir = branches.path_on(b, &node.path);
                let read = fs::read_dir(&dir).map_err(|e| io_error_to_errno(&e))?;

                // Two passes per branch: whiteouts in a branch hide names
                // in the same branch regardless of readdir order.
                let mut plain: Vec<(OsString, FileType)> = Vec::new();
                let mut branch_hidden: HashSet<OsString> = HashSet::new();
                for entry in read {
                    let entry = entry.map_err(|e| io_error_to_errno(&e))?;
                    let name = entry.file_name();
                    if let Some(target) = Whiteout::extract_target(&name) {
                        if target != OsStr::new(crate::union::whiteout::DIR_OPAQUE_NAME) {
                            branch_hidden.insert(target);
                        }
                        continue;
                    }
                    let kind = entry
                        .file_type()
                        .map(std_filetype_to_fuser)
                        .unwrap_or(FileType::RegularFile);
                    plain.push((name, kind));
                }

                for (name, kind) in plain {
                    if branch_hidden.contains(&name)
                        || hidden.contains(&name)
                        || taken.contains(&name)
                    {
                        continue;
                    }
                    taken.insert(name.clone());
                    merged.push(Merged { name, kind });
                }
                hidden.extend(branch_hidden);
            }
        }

        merged.sort_by(|a, b| a.name.cmp(&b.name));
        if merged.len() > DIR_EOF as usize {
            tracing::warn!(
                "directory {:?} exceeds the {}-entry readdir window; truncating",
                node.path,
                DIR_EOF
            );
            merged.truncate(DIR_EOF as usize);
        }

        // Resolve each name to a union inode so readdir and lookup agree.
        let mut snapshot = Vec::with_capacity(merged.len());
        for m in merged {
            let ino = match self.nodes.read().lookup_child(node.ino, &m.name) {
                Some(ino) => ino,
                None => match self.do_lookup(node.ino, &m.name) {
                    Ok(attrs) => attrs.ino,
                    // Raced away between scan and resolve; skip it.
                    Err(_) => continue,
                },
            };
            snapshot.push(DirEntrySnap {
                name: m.name,
                ino,
                kind: m.kind,
            });
        }
        Ok(snapshot)
    }

    /// Entries from `offset` onward, each tagged with the cookie-encoded
    /// offset of its successor.
    #[allow(clippy::type_complexity)]
    pub fn do_readdir(
        &self,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> Result<Vec<(u64, i64, FileType, OsString)>, i32> {
        let file_arc = self.file_revalidate(ino, fh, false)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        if node.attrs.kind != FileType::Directory {
            return Err(libc::ENOTDIR);
        }

        let (cookie, idx) = offset_to_rdstate(offset);
        let mut uf = file_arc.lock();

        let matches = uf
            .rdstate
            .as_ref()
            .map(|s| s.cookie == cookie)
            .unwrap_or(false);
        if offset == 0 || !matches {
            let entries = self.build_dir_snapshot(&node)?;
            uf.rdstate = Some(DirState {
                cookie: self.alloc_rd_cookie(),
                entries,
            });
        }

        let state = uf.rdstate.as_ref().unwrap();
        let start = if offset == 0 { 0 } else { idx as usize };
        let out = state
            .entries
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, e)| {
                (
                    e.ino,
                    rdstate_to_offset(state.cookie, (i + 1) as u32),
                    e.kind,
                    e.name.clone(),
                )
            })
            .collect();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // statfs / ioctl / xattr
    // ------------------------------------------------------------------

    pub fn do_statfs(&self) -> Result<nix::sys::statvfs::Statvfs, i32> {
        let branches = self.branches.read();
        let root = branches.path_on(0, Path::new(""));
        drop(branches);
        nix::sys::statvfs::statvfs(&root).map_err(|e| e as i32)
    }

    /// The union's own ioctls. Anything unrecognized is ENOTTY; lower
    /// passthrough is the mount shim's business, not the core's.
    pub fn do_ioctl(&self, ino: u64, _fh: u64, cmd: u32) -> Result<Vec<u8>, i32> {
        match cmd {
            IOCTL_INCGEN => {
                tracing::warn!("incgen ioctl is deprecated; remount instead");
                Err(libc::ENOSYS)
            }
            IOCTL_QUERYFILE => self.queryfile(ino),
            _ => Err(libc::ENOTTY),
        }
    }

    /// Bitmask of branches holding this file, in the 1024-branch portable
    /// form. Probes every branch via a partial scan without disturbing the
    /// node's own fan-out.
    fn queryfile(&self, ino: u64) -> Result<Vec<u8>, i32> {
        self.revalidate_chain(ino)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        let pnode = self.node_snapshot(node.parent).ok_or(libc::ESTALE)?;

        let branches = self.branches.read();
        let fanout = match lookup_fanout(
            &branches,
            &self.sioq,
            &pnode.path,
            &pnode.fanout,
            &node.name,
            LookupMode::Partial,
            Some(node.fanout.clone()),
        )? {
            LookupOutcome::Positive { fanout } => fanout,
            LookupOutcome::Negative { .. } => return Err(libc::ESTALE),
        };

        let mut mask = vec![0u8; QUERYFILE_MAX_BRANCHES / 8];
        for b in fanout.populated() {
            mask[b as usize / 8] |= 1 << (b as usize % 8);
        }
        Ok(mask)
    }

    pub fn do_getxattr(&self, ino: u64, name: &OsStr) -> Result<Vec<u8>, i32> {
        self.revalidate_chain(ino)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        let branches = self.branches.read();
        let path = branches.path_on(node.fanout.start(), &node.path);
        drop(branches);

        match xattr::get(&path, name) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(libc::ENODATA),
            Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    pub fn do_listxattr(&self, ino: u64) -> Result<Vec<u8>, i32> {
        self.revalidate_chain(ino)?;
        let node = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        let branches = self.branches.read();
        let path = branches.path_on(node.fanout.start(), &node.path);
        drop(branches);

        let mut data = Vec::new();
        let attrs = xattr::list(&path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        for attr in attrs {
            data.extend_from_slice(attr.as_bytes());
            data.push(0);
        }
        Ok(data)
    }

    pub fn do_setxattr(&self, ino: u64, name: &OsStr, value: &[u8]) -> Result<(), i32> {
        self.revalidate_chain(ino)?;
        let lock = self.node_lock(ino);
        let _guard = lock.lock();

        {
            let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
            let branches = self.branches.read();
            let is_ro = branches.is_robranch(node.fanout.start());
            drop(branches);
            if is_ro {
                self.copyup_node(ino, None)?;
            }
        }

        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        let branches = self.branches.read();
        let path = branches.path_on(node.fanout.start(), &node.path);
        drop(branches);

        xattr::set(&path, name, value).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    pub fn do_removexattr(&self, ino: u64, name: &OsStr) -> Result<(), i32> {
        self.revalidate_chain(ino)?;
        let lock = self.node_lock(ino);
        let _guard = lock.lock();

        {
            let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
            let branches = self.branches.read();
            let is_ro = branches.is_robranch(node.fanout.start());
            drop(branches);
            if is_ro {
                self.copyup_node(ino, None)?;
            }
        }

        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        let branches = self.branches.read();
        let path = branches.path_on(node.fanout.start(), &node.path);
        drop(branches);

        xattr::remove(&path, name).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Classic Unix permission intersection against one lower object.
fn check_unix_access(meta: &fs::Metadata, mask: i32, uid: u32, gid: u32) -> Result<(), i32> {
    use std::os::unix::fs::MetadataExt;

    let mode = meta.mode();
    let mut want = 0u32;
    if mask & libc::R_OK != 0 {
        want |= 4;
    }
    if mask & libc::W_OK != 0 {
        want |= 2;
    }
    if mask & libc::X_OK != 0 {
        want |= 1;
    }

    // Root bypasses rwx checks except execute, which needs at least one
    // x bit somewhere.
    if uid == 0 {
        if want & 1 != 0 && mode & 0o111 == 0 {
            return Err(libc::EACCES);
        }
        return Ok(());
    }

    let granted = if meta.uid() == uid {
        (mode >> 6) & 7
    } else if meta.gid() == gid {
        (mode >> 3) & 7
    } else {
        mode & 7
    };

    if granted & want == want {
        Ok(())
    } else {
        Err(libc::EACCES)
    }
}

fn std_filetype_to_fuser(ft: std::fs::FileType) -> FileType {
    if ft.is_file() {
        FileType::RegularFile
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}
