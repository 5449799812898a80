//! Branch management: generation bumps, open files across branch
//! reshuffles, and the query-file ioctl.

mod common;

use common::{rw_ro, rw_rw, ROOT};
use std::ffi::OsStr;
use std::fs;
use stratafs::union::{IOCTL_INCGEN, IOCTL_QUERYFILE};
use stratafs::{BranchPerm, BranchSpec, UnionFs};

#[test]
fn test_generation_is_monotonic() {
    let fix = rw_rw();
    let g0 = fix.fs.generation();

    let extra = fix.tmp.path().join("extra");
    fs::create_dir_all(&extra).unwrap();
    fix.fs.add_branch(1, &extra, BranchPerm::ReadOnly).unwrap();
    let g1 = fix.fs.generation();
    assert!(g1 > g0);

    fix.fs.remove_branch(1).unwrap();
    assert!(fix.fs.generation() > g1);
}

#[test]
fn test_lookup_survives_branch_insertion() {
    let fix = rw_ro();
    fix.write_branch(1, "hello", b"world");
    let ino = fix.ino_of("hello");

    let top = fix.tmp.path().join("newtop");
    fs::create_dir_all(&top).unwrap();
    fix.fs.add_branch(0, &top, BranchPerm::ReadWrite).unwrap();

    // The cached node revalidates against the shifted layout.
    let attrs = fix.fs.do_getattr(ino).unwrap();
    assert_eq!(attrs.size, 5);
    assert_eq!(fix.read_union("hello"), b"world");
}

#[test]
fn test_open_file_survives_branch_insertion() {
    let fix = rw_ro();
    fix.write_branch(1, "hello", b"world");

    let ino = fix.ino_of("hello");
    let fh = fix.fs.do_open(ino, libc::O_RDONLY).unwrap();
    assert_eq!(fix.fs.do_read(ino, fh, 0, 5).unwrap(), b"world");

    // An administrator slides a fresh branch on top mid-read.
    let top = fix.tmp.path().join("newtop");
    fs::create_dir_all(&top).unwrap();
    fix.fs.add_branch(0, &top, BranchPerm::ReadWrite).unwrap();

    // The handle reopens against the new layout and keeps returning the
    // same bytes.
    assert_eq!(fix.fs.do_read(ino, fh, 0, 5).unwrap(), b"world");
    fix.fs.do_release(ino, fh).unwrap();
}

#[test]
fn test_open_file_blocks_branch_removal() {
    let fix = rw_ro();
    fix.write_branch(1, "pinned", b"x");

    let ino = fix.ino_of("pinned");
    let fh = fix.fs.do_open(ino, libc::O_RDONLY).unwrap();

    // The open handle holds a reference against its branch.
    assert!(fix.fs.remove_branch(1).is_err());

    fix.fs.do_release(ino, fh).unwrap();
    assert!(fix.fs.remove_branch(1).is_ok());
}

#[test]
fn test_write_after_new_top_branch_copies_to_it() {
    let fix = rw_rw();
    fix.write_branch(0, "f", b"original");

    let top = fix.tmp.path().join("newtop");
    fs::create_dir_all(&top).unwrap();
    fix.fs.add_branch(0, &top, BranchPerm::ReadWrite).unwrap();

    // After the shift the old branch is still writable, so writes keep
    // landing on the file's own branch.
    fix.write_union("f", b"REWRITTEN");
    assert_eq!(fs::read(fix.on(0, "f")).unwrap(), b"REWRITTEN");
    assert!(!top.join("f").exists());
}

#[test]
fn test_removal_of_unrelated_branch_keeps_union_consistent() {
    let fix = rw_rw();
    fix.write_branch(0, "keep", b"data");

    let extra = fix.tmp.path().join("extra");
    fs::create_dir_all(&extra).unwrap();
    fix.fs.add_branch(2, &extra, BranchPerm::ReadOnly).unwrap();
    fix.fs.remove_branch(2).unwrap();

    assert_eq!(fix.read_union("keep"), b"data");
}

#[test]
fn test_queryfile_reports_all_holding_branches() {
    let fix = rw_rw();
    fix.write_branch(0, "f", b"top");
    fix.write_branch(1, "f", b"bottom");

    let ino = fix.ino_of("f");
    let fh = fix.fs.do_open(ino, libc::O_RDONLY).unwrap();
    let mask = fix.fs.do_ioctl(ino, fh, IOCTL_QUERYFILE).unwrap();
    fix.fs.do_release(ino, fh).unwrap();

    assert_eq!(mask.len(), 1024 / 8);
    assert_eq!(mask[0], 0b11);

    // The probe must not widen the file's visible state: reads still come
    // from the top copy only.
    assert_eq!(fix.read_union("f"), b"top");
}

#[test]
fn test_incgen_ioctl_is_gone() {
    let fix = rw_rw();
    fix.write_branch(0, "f", b"x");
    let ino = fix.ino_of("f");
    let fh = fix.fs.do_open(ino, libc::O_RDONLY).unwrap();
    assert_eq!(
        fix.fs.do_ioctl(ino, fh, IOCTL_INCGEN).unwrap_err(),
        libc::ENOSYS
    );
    fix.fs.do_release(ino, fh).unwrap();
}

#[test]
fn test_union_requires_writable_top() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    fs::create_dir_all(&a).unwrap();

    assert!(UnionFs::new(
        vec![BranchSpec {
            root: a,
            perms: BranchPerm::ReadOnly,
        }],
        1,
    )
    .is_err());

    // Management must refuse to demote the top the same way.
    let fix = rw_ro();
    let extra = fix.tmp.path().join("extra");
    fs::create_dir_all(&extra).unwrap();
    assert!(fix
        .fs
        .add_branch(0, &extra, BranchPerm::ReadOnly)
        .is_err());
}

#[test]
fn test_new_top_branch_takes_new_files() {
    let fix = rw_ro();
    fix.write_branch(1, "existing", b"x");

    let top = fix.tmp.path().join("newtop");
    fs::create_dir_all(&top).unwrap();
    fix.fs.add_branch(0, &top, BranchPerm::ReadWrite).unwrap();

    let (attrs, fh) = fix
        .fs
        .do_create(ROOT, OsStr::new("fresh"), 0o644, libc::O_WRONLY)
        .unwrap();
    fix.fs.do_write(attrs.ino, fh, 0, b"new file").unwrap();
    fix.fs.do_release(attrs.ino, fh).unwrap();

    assert!(top.join("fresh").exists());
    assert!(!fix.on(0, "fresh").exists());
}
