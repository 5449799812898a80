//! Shared fixtures for the union integration tests.
//!
//! Tests drive the core `do_*` surface of [`UnionFs`] directly against
//! real temporary branch directories; no FUSE mount is involved.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use stratafs::{BranchPerm, BranchSpec, UnionFs};
use tempfile::TempDir;

/// The union root inode, as FUSE numbers it.
pub const ROOT: u64 = 1;

pub struct Fixture {
    // Held for the lifetime of the branches.
    pub tmp: TempDir,
    pub fs: UnionFs,
    pub roots: Vec<PathBuf>,
}

/// Build a union of `perms.len()` empty branches named b0, b1, ...
pub fn union(perms: &[BranchPerm]) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let mut specs = Vec::new();
    let mut roots = Vec::new();
    for (i, &perms) in perms.iter().enumerate() {
        let root = tmp.path().join(format!("b{}", i));
        fs::create_dir_all(&root).unwrap();
        specs.push(BranchSpec {
            root: root.clone(),
            perms,
        });
        roots.push(root);
    }
    let fs = UnionFs::new(specs, 1).unwrap();
    Fixture { tmp, fs, roots }
}

/// The classic two-branch setup: writable top, read-only bottom.
pub fn rw_ro() -> Fixture {
    union(&[BranchPerm::ReadWrite, BranchPerm::ReadOnly])
}

/// Two writable branches.
pub fn rw_rw() -> Fixture {
    union(&[BranchPerm::ReadWrite, BranchPerm::ReadWrite])
}

impl Fixture {
    /// Absolute path of `rel` on branch `b`, bypassing the union.
    pub fn on(&self, b: usize, rel: &str) -> PathBuf {
        self.roots[b].join(rel)
    }

    pub fn write_branch(&self, b: usize, rel: &str, contents: &[u8]) {
        let path = self.on(b, rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    pub fn ino(&self, parent: u64, name: &str) -> u64 {
        self.fs
            .do_lookup(parent, Path::new(name).as_os_str())
            .unwrap()
            .ino
    }

    /// Resolve a /-separated path from the union root.
    pub fn ino_of(&self, path: &str) -> u64 {
        let mut ino = ROOT;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            ino = self.ino(ino, comp);
        }
        ino
    }

    /// Read the whole file through the union, open-to-close.
    pub fn read_union(&self, path: &str) -> Vec<u8> {
        let ino = self.ino_of(path);
        let fh = self.fs.do_open(ino, libc::O_RDONLY).unwrap();
        let data = self.fs.do_read(ino, fh, 0, 1 << 20).unwrap();
        self.fs.do_release(ino, fh).unwrap();
        data
    }

    /// Overwrite a union file from offset 0, open-to-close.
    pub fn write_union(&self, path: &str, data: &[u8]) {
        let ino = self.ino_of(path);
        let fh = self.fs.do_open(ino, libc::O_WRONLY).unwrap();
        self.fs.do_write(ino, fh, 0, data).unwrap();
        self.fs.do_release(ino, fh).unwrap();
    }

    /// Names visible in a union directory, sorted.
    pub fn list_union(&self, path: &str) -> Vec<String> {
        let ino = if path.is_empty() { ROOT } else { self.ino_of(path) };
        let fh = self.fs.do_opendir(ino, libc::O_RDONLY).unwrap();
        let mut names = Vec::new();
        let mut offset = 0;
        loop {
            let entries = self.fs.do_readdir(ino, fh, offset).unwrap();
            if entries.is_empty() {
                break;
            }
            for (_, next, _, name) in entries {
                names.push(name.to_string_lossy().into_owned());
                offset = next;
            }
        }
        self.fs.do_release(ino, fh).unwrap();
        names
    }
}
