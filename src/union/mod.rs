//! The union filesystem core and its FUSE shim.
//!
//! `UnionFs` owns the branch table, the fan-out node table, the open-file
//! table and the side-IO queue. Every operation is implemented as a
//! `do_*` method returning errno-style results (`ops.rs`, `reval.rs`); the
//! `fuser::Filesystem` impl below is a thin shim that takes the object
//! lock, delegates, and converts the result into a FUSE reply. The test
//! suite drives the `do_*` surface directly against real directories, no
//! mount required.

pub mod branch;
mod convert;
mod copyup;
mod dirhelper;
mod file;
mod lookup;
pub mod mount;
mod ops;
mod reval;
mod sioq;
pub mod types;
pub mod whiteout;

pub use branch::{parse_dirs_spec, parse_mount_options, BranchPerm, BranchSpec, MAX_BRANCHES};
pub use ops::SetattrRequest;
pub use types::{IOCTL_INCGEN, IOCTL_QUERYFILE};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow, FUSE_ROOT_ID,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::Result;
use branch::BranchTable;
use convert::metadata_to_fileattr;
use file::UnionFile;
use sioq::SideIo;
use types::{Fanout, LowerRef, Node, NodeTable, MAX_RD_COOKIE};

pub struct UnionFs {
    /// The superblock lock: read-held by every operation, write-held only
    /// by branch management.
    pub(crate) branches: Arc<RwLock<BranchTable>>,
    /// Bumped on any branch add/remove/reorder; nodes and open files with
    /// an older generation must revalidate before use.
    pub(crate) generation: Arc<AtomicU32>,
    pub(crate) nodes: Arc<RwLock<NodeTable>>,
    next_ino: Arc<Mutex<u64>>,
    pub(crate) files: Arc<RwLock<HashMap<u64, Arc<Mutex<UnionFile>>>>>,
    next_fh: Arc<Mutex<u64>>,
    next_rd_cookie: Arc<Mutex<u32>>,
    /// Per-node operation locks; children are taken before parents, and
    /// unrelated pairs in identity (inode-number) order.
    node_locks: Arc<RwLock<HashMap<u64, Arc<Mutex<()>>>>>,
    pub(crate) sioq: SideIo,
    /// Attribute and entry cache timeout handed to FUSE.
    ttl: Duration,
}

impl UnionFs {
    pub fn new(specs: Vec<BranchSpec>, ttl_secs: u64) -> Result<Self> {
        let table = BranchTable::new(specs)?;

        let fs = UnionFs {
            branches: Arc::new(RwLock::new(table)),
            generation: Arc::new(AtomicU32::new(1)),
            nodes: Arc::new(RwLock::new(NodeTable::new())),
            // FUSE reserves inode 1 for the root directory.
            next_ino: Arc::new(Mutex::new(2)),
            files: Arc::new(RwLock::new(HashMap::new())),
            next_fh: Arc::new(Mutex::new(1)),
            next_rd_cookie: Arc::new(Mutex::new(1)),
            node_locks: Arc::new(RwLock::new(HashMap::new())),
            sioq: SideIo::spawn(),
            ttl: Duration::from_secs(ttl_secs),
        };

        fs.install_root()?;
        Ok(fs)
    }

    fn install_root(&self) -> Result<()> {
        let (fanout, meta) = {
            let branches = self.branches.read();
            let fanout = root_fanout(&branches)?;
            let meta = std::fs::metadata(branches.path_on(0, Path::new("")))?;
            (fanout, meta)
        };
        let attrs = metadata_to_fileattr(&meta, FUSE_ROOT_ID);

        self.nodes.write().insert(Node {
            ino: FUSE_ROOT_ID,
            parent: FUSE_ROOT_ID,
            name: Default::default(),
            path: PathBuf::new(),
            fanout,
            attrs,
            gen: self.sbgen(),
            stale: false,
            totalopens: 0,
            deleted: false,
        });
        Ok(())
    }

    pub(crate) fn sbgen(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Current superblock generation; monotonically non-decreasing.
    pub fn generation(&self) -> u32 {
        self.sbgen()
    }

    pub(crate) fn alloc_ino(&self) -> u64 {
        let mut next = self.next_ino.lock();
        let ino = *next;
        // wrapping_add rather than panicking on the (theoretical) u64
        // exhaustion; ancient inodes are long gone by then.
        *next = next.wrapping_add(1);
        ino
    }

    pub(crate) fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        *next = next.wrapping_add(1);
        fh
    }

    /// Next readdir snapshot cookie, wrapped to the 12 bits the telldir
    /// encoding gives us and kept nonzero.
    pub(crate) fn alloc_rd_cookie(&self) -> u32 {
        let mut next = self.next_rd_cookie.lock();
        let cookie = *next;
        *next = (*next % MAX_RD_COOKIE) + 1;
        cookie
    }

    pub(crate) fn node_lock(&self, ino: u64) -> Arc<Mutex<()>> {
        let mut locks = self.node_locks.write();
        locks
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Locks for two possibly-unrelated nodes, in identity order so that
    /// concurrent pair-lockers cannot deadlock.
    pub(crate) fn node_lock_pair(&self, a: u64, b: u64) -> (Arc<Mutex<()>>, Arc<Mutex<()>>) {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        (self.node_lock(first), self.node_lock(second))
    }

    pub(crate) fn drop_node_lock(&self, ino: u64) {
        self.node_locks.write().remove(&ino);
    }

    pub(crate) fn node_snapshot(&self, ino: u64) -> Option<Node> {
        self.nodes.read().peek(ino).cloned()
    }

    /// Add a branch at `index` (0 = new top). Existing branches keep their
    /// IDs; the generation bump makes every cached fan-out revalidate.
    pub fn add_branch(&self, index: usize, root: &Path, perms: BranchPerm) -> Result<()> {
        let mut table = self.branches.write();
        table.add_branch(index, root, perms)?;
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "added branch {} at position {}, generation now {}",
            root.display(),
            index,
            gen
        );
        Ok(())
    }

    /// Remove the branch at `index`. Refused while files are open on it.
    pub fn remove_branch(&self, index: usize) -> Result<()> {
        let mut table = self.branches.write();
        table.remove_branch(index)?;
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("removed branch {}, generation now {}", index, gen);
        Ok(())
    }
}

/// The root fans out across every branch unconditionally.
pub(crate) fn root_fanout(branches: &BranchTable) -> Result<Fanout> {
    let mut fanout = Fanout::new(branches.len());
    for (b, branch) in branches.iter().enumerate() {
        let meta = std::fs::metadata(&branch.root)?;
        fanout.set_lower(
            b as i32,
            LowerRef {
                kind: fuser::FileType::Directory,
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                ctime: convert::ctime_of(&meta),
                nlink: {
                    use std::os::unix::fs::MetadataExt;
                    meta.nlink() as u32
                },
            },
        );
    }
    fanout.set_start(0);
    fanout.set_end(branches.last_index());
    Ok(fanout)
}

impl Filesystem for UnionFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("stratafs mounted ({} branches)", self.branches.read().len());
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("stratafs unmounted");
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        let gone = {
            let nodes = self.nodes.read();
            nodes
                .peek(ino)
                .map(|n| n.deleted && n.totalopens == 0)
                .unwrap_or(false)
        };
        if gone {
            self.nodes.write().remove(ino);
            self.drop_node_lock(ino);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        match self.do_lookup(parent, name) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        match self.do_getattr(ino) {
            Ok(attrs) => reply.attr(&self.ttl, &attrs),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        tracing::debug!("setattr(ino={}, size={:?}, mode={:?})", ino, size, mode);
        let request = SetattrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        match self.do_setattr(ino, request) {
            Ok(attrs) => reply.attr(&self.ttl, &attrs),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.do_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        match self.do_mknod(parent, name, mode, rdev) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        match self.do_mkdir(parent, name, mode) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        tracing::debug!("symlink(parent={}, name={:?} -> {:?})", parent, name, link);
        match self.do_symlink(parent, name, link) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        tracing::debug!(
            "rename({}/{:?} -> {}/{:?})",
            parent,
            name,
            newparent,
            newname
        );
        match self.do_rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        tracing::debug!("link(ino={} -> {}/{:?})", ino, newparent, newname);
        match self.do_link(ino, newparent, newname) {
            Ok(attrs) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        match self.do_read(ino, fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        match self.do_write(ino, fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.do_flush(ino, fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_release(ino, fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.do_fsync(ino, fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("opendir(ino={})", ino);
        match self.do_opendir(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        match self.do_readdir(ino, fh, offset) {
            Ok(entries) => {
                for (child_ino, next_offset, kind, name) in entries {
                    if reply.add(child_ino, next_offset, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.do_release(ino, fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn fsyncdir(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        // Lower directories are synced by their own filesystems.
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.do_statfs() {
            Ok(s) => reply.statfs(
                s.blocks(),
                s.blocks_free(),
                s.blocks_available(),
                s.files(),
                s.files_free(),
                s.block_size() as u32,
                s.name_max() as u32,
                s.fragment_size() as u32,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self.do_setxattr(ino, name, value) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.do_getxattr(ino, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if size >= value.len() as u32 {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        match self.do_listxattr(ino) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if size >= data.len() as u32 {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.do_removexattr(ino, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.do_access(ino, mask, req.uid(), req.gid()) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        match self.do_create(parent, name, mode, flags) {
            Ok((attrs, fh)) => reply.created(&self.ttl, &attrs, 0, fh, flags as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn ioctl(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        _in_data: &[u8],
        _out_size: u32,
        reply: fuser::ReplyIoctl,
    ) {
        match self.do_ioctl(ino, fh, cmd) {
            Ok(data) => reply.ioctl(0, &data),
            Err(errno) => reply.error(errno),
        }
    }
}
