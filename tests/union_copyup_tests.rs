//! Copy-up: promotion on write, idempotence, delayed copy-up through open
//! handles, and the silly-rename path for open-but-deleted files.

mod common;

use common::{rw_ro, union, ROOT};
use std::ffi::OsStr;
use stratafs::{BranchPerm, SetattrRequest};

#[test]
fn test_write_copies_up_and_preserves_lower() {
    let fix = rw_ro();
    fix.write_branch(1, "hello", b"world");

    assert_eq!(fix.read_union("hello"), b"world");
    fix.write_union("hello", b"WORLD");

    // The copy lives on the writable branch now; the read-only original
    // is untouched.
    assert_eq!(std::fs::read(fix.on(0, "hello")).unwrap(), b"WORLD");
    assert_eq!(std::fs::read(fix.on(1, "hello")).unwrap(), b"world");
    assert_eq!(fix.read_union("hello"), b"WORLD");
}

#[test]
fn test_partial_overwrite_keeps_copied_tail() {
    let fix = rw_ro();
    fix.write_branch(1, "f", b"0123456789");

    let ino = fix.ino_of("f");
    let fh = fix.fs.do_open(ino, libc::O_WRONLY).unwrap();
    fix.fs.do_write(ino, fh, 0, b"XX").unwrap();
    fix.fs.do_release(ino, fh).unwrap();

    // The whole file was promoted before the two-byte write landed.
    assert_eq!(fix.read_union("f"), b"XX23456789");
}

#[test]
fn test_truncating_open_copies_up_nothing() {
    let fix = rw_ro();
    fix.write_branch(1, "big", b"lots of bytes here");

    let ino = fix.ino_of("big");
    let fh = fix
        .fs
        .do_open(ino, libc::O_WRONLY | libc::O_TRUNC)
        .unwrap();
    fix.fs.do_write(ino, fh, 0, b"tiny").unwrap();
    fix.fs.do_release(ino, fh).unwrap();

    assert_eq!(fix.read_union("big"), b"tiny");
    assert_eq!(
        std::fs::read(fix.on(1, "big")).unwrap(),
        b"lots of bytes here"
    );
}

#[test]
fn test_setattr_chmod_copies_up() {
    use std::os::unix::fs::PermissionsExt;

    let fix = rw_ro();
    fix.write_branch(1, "f", b"content");

    let ino = fix.ino_of("f");
    let attrs = fix
        .fs
        .do_setattr(
            ino,
            SetattrRequest {
                mode: Some(0o600),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(attrs.perm, 0o600);

    // Promoted byte-for-byte, then chmodded on the top branch only.
    assert_eq!(std::fs::read(fix.on(0, "f")).unwrap(), b"content");
    let lower_mode = std::fs::metadata(fix.on(1, "f")).unwrap().permissions().mode();
    assert_ne!(lower_mode & 0o7777, 0o600);
}

#[test]
fn test_setattr_truncate_caps_copyup() {
    let fix = rw_ro();
    fix.write_branch(1, "f", b"0123456789");

    let ino = fix.ino_of("f");
    let attrs = fix
        .fs
        .do_setattr(
            ino,
            SetattrRequest {
                size: Some(4),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(attrs.size, 4);
    assert_eq!(fix.read_union("f"), b"0123");
    assert_eq!(std::fs::read(fix.on(1, "f")).unwrap(), b"0123456789");
}

#[test]
fn test_repeated_copyup_is_idempotent() {
    let fix = rw_ro();
    fix.write_branch(1, "f", b"stable content");

    let ino = fix.ino_of("f");
    for _ in 0..2 {
        fix.fs
            .do_setattr(
                ino,
                SetattrRequest {
                    mode: Some(0o640),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(std::fs::read(fix.on(0, "f")).unwrap(), b"stable content");
    }
}

#[test]
fn test_copyup_replicates_parent_chain() {
    let fix = rw_ro();
    fix.write_branch(1, "a/b/deep", b"payload");

    fix.write_union("a/b/deep", b"PAYLOAD");

    assert!(fix.on(0, "a").is_dir());
    assert!(fix.on(0, "a/b").is_dir());
    assert_eq!(std::fs::read(fix.on(0, "a/b/deep")).unwrap(), b"PAYLOAD");
    assert_eq!(std::fs::read(fix.on(1, "a/b/deep")).unwrap(), b"payload");
}

#[test]
fn test_copyup_skips_interior_ro_branches() {
    let fix = union(&[
        BranchPerm::ReadWrite,
        BranchPerm::ReadOnly,
        BranchPerm::ReadOnly,
    ]);
    fix.write_branch(2, "f", b"bottom");

    fix.write_union("f", b"BOTTOM");

    // Branch 1 is read-only; the promotion skipped it and landed on 0.
    assert!(!fix.on(1, "f").exists());
    assert_eq!(std::fs::read(fix.on(0, "f")).unwrap(), b"BOTTOM");
}

#[test]
fn test_open_deleted_file_copyup_silly_renames() {
    let fix = rw_ro();
    fix.write_branch(1, "doomed", b"payload");

    let ino = fix.ino_of("doomed");
    let fh = fix.fs.do_open(ino, libc::O_RDWR).unwrap();

    // Unlink while open: the name goes away, the handle stays usable.
    fix.fs.do_unlink(ROOT, OsStr::new("doomed")).unwrap();
    assert_eq!(
        fix.fs.do_lookup(ROOT, OsStr::new("doomed")).unwrap_err(),
        libc::ENOENT
    );

    // First write triggers the delayed copy-up; with the name already
    // deleted it lands under a generated temporary name.
    fix.fs.do_write(ino, fh, 0, b"PAYLOAD").unwrap();
    assert_eq!(fix.fs.do_read(ino, fh, 0, 100).unwrap(), b"PAYLOAD");

    let silly: Vec<_> = std::fs::read_dir(&fix.roots[0])
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".stratafs"))
        .collect();
    assert_eq!(silly.len(), 1, "expected one silly-renamed file");

    // Last close reaps the temporary; the read-only source survives.
    fix.fs.do_release(ino, fh).unwrap();
    assert!(!fix.on(0, &silly[0]).exists());
    assert_eq!(std::fs::read(fix.on(1, "doomed")).unwrap(), b"payload");
}

#[test]
fn test_copyup_of_symlink_on_rename() {
    let fix = rw_ro();
    std::os::unix::fs::symlink("target", fix.on(1, "ln")).unwrap();

    fix.fs
        .do_rename(ROOT, OsStr::new("ln"), ROOT, OsStr::new("ln2"))
        .unwrap();

    let ino = fix.ino_of("ln2");
    assert_eq!(fix.fs.do_readlink(ino).unwrap(), b"target");
    assert_eq!(
        std::fs::read_link(fix.on(1, "ln")).unwrap(),
        std::path::PathBuf::from("target")
    );
}

#[test]
fn test_flush_syncs_visible_size() {
    let fix = rw_ro();
    fix.write_branch(1, "f", b"abc");

    let ino = fix.ino_of("f");
    let fh = fix.fs.do_open(ino, libc::O_WRONLY).unwrap();
    fix.fs.do_write(ino, fh, 3, b"def").unwrap();
    fix.fs.do_flush(ino, fh).unwrap();

    let attrs = fix.fs.do_getattr(ino).unwrap();
    assert_eq!(attrs.size, 6);
    fix.fs.do_release(ino, fh).unwrap();
}
