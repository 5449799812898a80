//! Promotion of objects from a lower branch to a higher writable branch.
//!
//! Copy-up replicates the missing parent chain on the destination branch,
//! then recreates the object there: regular files are streamed up to a size
//! cap, symlinks are re-targeted, directories carry their opacity over.
//! Failure unwinds everything created so far, in reverse order, so the
//! fan-out is observationally unchanged unless the whole promotion lands.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use fuser::FileType;

use crate::union::branch::BranchTable;
use crate::union::convert::{io_error_to_errno, metadata_to_filetype};
use crate::union::sioq::{SideIo, SideIoReply, SideIoRequest};
use crate::union::whiteout::{silly_name, Whiteout};

/// Replicate the directory chain of `rel_dir` onto branch `dst`, creating
/// missing ancestors with the mode of their counterpart on `src` (falling
/// back to the first branch that has one). Returns the directories it
/// created, top-down, so the caller can unwind on a later failure.
pub(crate) fn create_parents(
    branches: &BranchTable,
    rel_dir: &Path,
    src: i32,
    dst: i32,
) -> Result<Vec<PathBuf>, i32> {
    let mut created: Vec<PathBuf> = Vec::new();
    let mut prefix = PathBuf::new();

    for comp in rel_dir.components() {
        prefix.push(comp);
        let dst_dir = branches.path_on(dst, &prefix);
        match fs::symlink_metadata(&dst_dir) {
            Ok(meta) => {
                if !meta.is_dir() {
                    unwind(&created);
                    return Err(libc::ENOTDIR);
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                unwind(&created);
                return Err(io_error_to_errno(&e));
            }
        }

        let mode = source_dir_mode(branches, &prefix, src).unwrap_or(0o755);
        if let Err(e) = fs::create_dir(&dst_dir) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                unwind(&created);
                return Err(io_error_to_errno(&e));
            }
            // Raced with another copy-up; someone else made it.
            continue;
        }
        let _ = fs::set_permissions(&dst_dir, fs::Permissions::from_mode(mode));
        created.push(dst_dir);
    }

    Ok(created)
}

fn source_dir_mode(branches: &BranchTable, rel: &Path, src: i32) -> Option<u32> {
    if let Ok(meta) = fs::symlink_metadata(branches.path_on(src, rel)) {
        return Some(meta.mode() & 0o7777);
    }
    for b in 0..=branches.last_index() {
        if let Ok(meta) = fs::symlink_metadata(branches.path_on(b, rel)) {
            if meta.is_dir() {
                return Some(meta.mode() & 0o7777);
            }
        }
    }
    None
}

fn unwind(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        let _ = fs::remove_dir(dir);
    }
}

fn unwind_with_target(created: &[PathBuf], target: &Path) {
    let _ = fs::remove_file(target).or_else(|_| fs::remove_dir(target));
    unwind(created);
}

/// Copy one object from `src_rel` on branch `src` to `dst_rel` on branch
/// `dst` (`dst < src`). `len` caps how many bytes of a regular file are
/// copied; `None` copies to EOF. Returns the destination metadata.
///
/// Copying the same object again over an existing destination fails with
/// `EEXIST` rather than clobbering it; the silly-rename retry loop depends
/// on that.
pub(crate) fn copyup_path(
    branches: &BranchTable,
    sioq: &SideIo,
    src_rel: &Path,
    dst_rel: &Path,
    src: i32,
    dst: i32,
    len: Option<u64>,
) -> Result<fs::Metadata, i32> {
    debug_assert!(dst < src, "copy-up must move left ({} -> {})", src, dst);

    if branches.is_robranch(dst) {
        return Err(libc::EROFS);
    }

    let src_abs = branches.path_on(src, src_rel);
    let dst_abs = branches.path_on(dst, dst_rel);

    let src_meta = fs::symlink_metadata(&src_abs).map_err(|e| io_error_to_errno(&e))?;
    let kind = metadata_to_filetype(&src_meta);
    let mode = src_meta.mode() & 0o7777;

    let created = match dst_rel.parent() {
        Some(parent) if parent != Path::new("") => {
            create_parents(branches, parent, src, dst)?
        }
        _ => Vec::new(),
    };

    let result = match kind {
        FileType::RegularFile => copy_file_contents(&src_abs, &dst_abs, mode, len),
        FileType::Symlink => fs::read_link(&src_abs)
            .and_then(|target| std::os::unix::fs::symlink(target, &dst_abs))
            .map_err(|e| io_error_to_errno(&e)),
        FileType::Directory => copy_dir_shell(sioq, &src_abs, &dst_abs, mode),
        _ => {
            // Device nodes and sockets are recreated by mknod at the
            // mutation layer; promoting them byte-wise makes no sense.
            Err(libc::EINVAL)
        }
    };

    if let Err(err) = result {
        if err == libc::EEXIST {
            // The destination already existed; it is not ours to remove.
            unwind(&created);
        } else {
            unwind_with_target(&created, &dst_abs);
        }
        return Err(err);
    }

    match fs::symlink_metadata(&dst_abs) {
        Ok(meta) => Ok(meta),
        Err(e) => {
            unwind_with_target(&created, &dst_abs);
            Err(io_error_to_errno(&e))
        }
    }
}

fn copy_file_contents(
    src_abs: &Path,
    dst_abs: &Path,
    mode: u32,
    len: Option<u64>,
) -> Result<(), i32> {
    let mut reader = File::open(src_abs).map_err(|e| io_error_to_errno(&e))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(dst_abs)
        .map_err(|e| io_error_to_errno(&e))?;

    let copied = match len {
        Some(cap) => io::copy(&mut io::Read::take(&mut reader, cap), &mut writer),
        None => io::copy(&mut reader, &mut writer),
    }
    .map_err(|e| io_error_to_errno(&e))?;

    tracing::debug!("copied up {} bytes {:?} -> {:?}", copied, src_abs, dst_abs);
    Ok(())
}

fn copy_dir_shell(sioq: &SideIo, src_abs: &Path, dst_abs: &Path, mode: u32) -> Result<(), i32> {
    fs::create_dir(dst_abs).map_err(|e| io_error_to_errno(&e))?;
    let _ = fs::set_permissions(dst_abs, fs::Permissions::from_mode(mode));

    // An opaque source stays opaque on the destination, or the promoted
    // directory would suddenly expose branches its source was hiding.
    if sioq.is_opaque(src_abs.to_path_buf())? {
        fs::write(Whiteout::opaque_path(dst_abs), b"").map_err(|e| io_error_to_errno(&e))?;
    }
    Ok(())
}

/// Copy up an open-but-unlinked file under a freshly generated name.
///
/// The visible name is already gone, so the promoted copy gets a
/// `.stratafs<ino><counter>` name instead; the probe for a free name runs
/// against the source branch, and an `EEXIST` from the actual copy (the
/// destination already had that name) simply retries with the next counter
/// value. Afterwards the source object is unlinked; the caller's open
/// handle holds the only remaining reference.
pub(crate) fn copyup_deleted_file(
    branches: &BranchTable,
    sioq: &SideIo,
    rel_path: &Path,
    src: i32,
    dst: i32,
    len: Option<u64>,
) -> Result<(OsString, fs::Metadata), i32> {
    let src_abs = branches.path_on(src, rel_path);
    let src_meta = fs::symlink_metadata(&src_abs).map_err(|e| io_error_to_errno(&e))?;
    let parent_rel = rel_path.parent().unwrap_or(Path::new("")).to_path_buf();

    // A generated name that is free in the source branch is very likely
    // free in the destination too; EEXIST from the copy catches the rest.
    const MAX_TRIES: u32 = 32;
    for _ in 0..MAX_TRIES {
        let name = silly_name(src_meta.ino());
        let probe = branches.path_on(src, &parent_rel).join(&name);
        if let SideIoReply::Exists(true) = sioq.submit(SideIoRequest::Lookup { path: probe })? {
            continue;
        }

        let dst_rel = parent_rel.join(&name);
        match copyup_path(branches, sioq, rel_path, &dst_rel, src, dst, len) {
            Ok(meta) => {
                // A read-only source branch keeps its copy; the whiteout
                // installed at unlink time already hides it.
                if !branches.is_robranch(src) {
                    if let Err(e) = fs::remove_file(&src_abs) {
                        tracing::warn!("cannot unlink copied-up source {:?}: {}", src_abs, e);
                    }
                }
                return Ok((name, meta));
            }
            Err(err) if err == libc::EEXIST => continue,
            Err(err) => return Err(err),
        }
    }

    tracing::warn!("no free temporary name for {:?}", rel_path);
    Err(libc::EEXIST)
}
