//! The branch table: an ordered vector of backing directories with
//! per-branch permissions and a stable numeric ID per mount generation.
//!
//! Branch 0 is the top (highest priority) and must be writable. Branch IDs
//! are reassigned whenever the table changes so that open files can detect
//! that the set of branches shifted underneath them and remap by ID rather
//! than by position.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Result, StrataError};

/// Hard cap on the number of branches in one union.
pub const MAX_BRANCHES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPerm {
    ReadOnly,
    ReadWrite,
}

impl BranchPerm {
    fn parse(mode: Option<&str>) -> Result<Self> {
        match mode {
            None | Some("rw") => Ok(BranchPerm::ReadWrite),
            Some("ro") => Ok(BranchPerm::ReadOnly),
            Some(other) => Err(StrataError::Branch(format!("unknown mode '{}'", other))),
        }
    }
}

/// One backing filesystem rooted at a host directory.
#[derive(Debug, Clone)]
pub struct Branch {
    pub root: PathBuf,
    pub perms: BranchPerm,
    /// Unique within the life of the mount; never reused after a reshuffle.
    pub id: u32,
    /// Number of lower files currently open against this branch. A branch
    /// with open files cannot be removed.
    pub open_files: Arc<AtomicU32>,
}

impl Branch {
    fn new(root: PathBuf, perms: BranchPerm, id: u32) -> Self {
        Branch {
            root,
            perms,
            id,
            open_files: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// The ordered branch vector plus the ID high-water mark. Guarded by the
/// superblock lock: read-locked by every operation, write-locked only by
/// branch management.
#[derive(Debug)]
pub struct BranchTable {
    branches: Vec<Branch>,
    high_branch_id: u32,
}

/// A parsed `dir[=mode]` element of the `dirs=` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub root: PathBuf,
    pub perms: BranchPerm,
}

/// Parse the comma-separated mount option list. `dirs=` is the only
/// recognized option; anything else is fatal.
pub fn parse_mount_options(options: &str) -> Result<Vec<BranchSpec>> {
    let mut specs: Option<Vec<BranchSpec>> = None;

    for opt in options.split(',').filter(|s| !s.is_empty()) {
        match opt.split_once('=') {
            Some(("dirs", value)) => {
                if specs.is_some() {
                    return Err(StrataError::Option("multiple dirs= given".to_string()));
                }
                specs = Some(parse_dirs_spec(value)?);
            }
            _ => {
                return Err(StrataError::Option(format!(
                    "unrecognized option '{}'",
                    opt
                )));
            }
        }
    }

    specs.ok_or_else(|| StrataError::Option("dirs= option required".to_string()))
}

/// Parse a branch specification of the form `dir[=mode](:dir[=mode])*`
/// where mode is `ro` or `rw` and defaults to `rw`.
pub fn parse_dirs_spec(spec: &str) -> Result<Vec<BranchSpec>> {
    let mut out = Vec::new();

    for part in spec.split(':').filter(|s| !s.is_empty()) {
        let (dir, mode) = match part.split_once('=') {
            Some((dir, mode)) => (dir, Some(mode)),
            None => (part, None),
        };
        if dir.is_empty() {
            return Err(StrataError::Branch(format!("empty directory in '{}'", part)));
        }
        out.push(BranchSpec {
            root: PathBuf::from(dir),
            perms: BranchPerm::parse(mode)?,
        });
    }

    if out.is_empty() {
        return Err(StrataError::Branch("no branches specified".to_string()));
    }
    if out[0].perms != BranchPerm::ReadWrite {
        return Err(StrataError::Branch(
            "leftmost branch must be writable".to_string(),
        ));
    }
    if out.len() > MAX_BRANCHES {
        return Err(StrataError::Branch(format!(
            "too many branches ({} > {})",
            out.len(),
            MAX_BRANCHES
        )));
    }

    Ok(out)
}

/// Two branches overlap if one root is an ancestor of the other in the host
/// namespace. Overlapping branches defeat coherency: a delete through one
/// branch would silently change another.
fn is_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn check_branch_dir(root: &Path) -> Result<PathBuf> {
    let canon = root
        .canonicalize()
        .map_err(|e| StrataError::Branch(format!("{}: {}", root.display(), e)))?;
    let meta = fs::metadata(&canon)?;
    if !meta.is_dir() {
        return Err(StrataError::NotADirectory(root.to_path_buf()));
    }
    Ok(canon)
}

impl BranchTable {
    /// Build the table from parsed specs, validating every rule that makes
    /// a union mountable. Failure here is fatal for the mount.
    pub fn new(specs: Vec<BranchSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(StrataError::Branch("no branches specified".to_string()));
        }
        if specs[0].perms != BranchPerm::ReadWrite {
            return Err(StrataError::Branch(
                "leftmost branch must be writable".to_string(),
            ));
        }
        if specs.len() > MAX_BRANCHES {
            return Err(StrataError::Branch(format!(
                "too many branches ({} > {})",
                specs.len(),
                MAX_BRANCHES
            )));
        }

        let mut roots: Vec<PathBuf> = Vec::with_capacity(specs.len());
        for spec in &specs {
            roots.push(check_branch_dir(&spec.root)?);
        }

        for i in 0..roots.len() {
            for j in i + 1..roots.len() {
                if is_overlap(&roots[i], &roots[j]) {
                    return Err(StrataError::Overlap(roots[i].clone(), roots[j].clone()));
                }
            }
        }

        let mut table = BranchTable {
            branches: Vec::with_capacity(specs.len()),
            high_branch_id: 0,
        };
        for (spec, root) in specs.into_iter().zip(roots) {
            let id = table.next_branch_id();
            table.branches.push(Branch::new(root, spec.perms, id));
        }
        Ok(table)
    }

    fn next_branch_id(&mut self) -> u32 {
        self.high_branch_id += 1;
        self.high_branch_id
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Index of the last branch, the `bend` of the whole union.
    pub fn last_index(&self) -> i32 {
        self.branches.len() as i32 - 1
    }

    pub fn get(&self, index: i32) -> Option<&Branch> {
        usize::try_from(index).ok().and_then(|i| self.branches.get(i))
    }

    pub fn branch(&self, index: i32) -> &Branch {
        &self.branches[index as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.iter()
    }

    /// Absolute path of `rel` inside branch `index`.
    pub fn path_on(&self, index: i32, rel: &Path) -> PathBuf {
        self.branch(index).root.join(rel)
    }

    /// Is this branch read-only? Writes to it must either fail with EROFS
    /// (branch 0) or trigger copy-up (anything deeper).
    pub fn is_robranch(&self, index: i32) -> bool {
        self.branch(index).perms == BranchPerm::ReadOnly
    }

    /// Resolve a branch ID back to its current position, or `None` if the
    /// branch was removed. Linear scan; the table is small.
    pub fn branch_id_to_index(&self, id: u32) -> Option<i32> {
        self.branches
            .iter()
            .position(|b| b.id == id)
            .map(|i| i as i32)
    }

    /// Retain a branch against removal while a lower file is open on it.
    pub fn branchget(&self, index: i32) {
        self.branch(index).open_files.fetch_add(1, Ordering::SeqCst);
    }

    pub fn branchput(&self, index: i32) {
        self.branch(index).open_files.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn open_files(&self, index: i32) -> u32 {
        self.branch(index).open_files.load(Ordering::SeqCst)
    }

    /// Insert a new branch at `index`, shifting lower branches right. The
    /// new branch gets a fresh ID; existing branches keep theirs. The caller
    /// holds the superblock write lock and bumps the generation after.
    pub fn add_branch(&mut self, index: usize, root: &Path, perms: BranchPerm) -> Result<()> {
        if index > self.branches.len() {
            return Err(StrataError::Branch(format!("index {} out of range", index)));
        }
        if self.branches.len() >= MAX_BRANCHES {
            return Err(StrataError::Branch("too many branches".to_string()));
        }
        if index == 0 && perms != BranchPerm::ReadWrite {
            return Err(StrataError::Branch(
                "leftmost branch must be writable".to_string(),
            ));
        }
        let canon = check_branch_dir(root)?;
        for b in &self.branches {
            if is_overlap(&b.root, &canon) {
                return Err(StrataError::Overlap(b.root.clone(), canon));
            }
        }

        let id = self.next_branch_id();
        self.branches.insert(index, Branch::new(canon, perms, id));
        Ok(())
    }

    /// Remove the branch at `index`. Refused while any file is open on it,
    /// when it is the last branch, or when removal would leave a read-only
    /// branch on top.
    pub fn remove_branch(&mut self, index: usize) -> Result<()> {
        if index >= self.branches.len() {
            return Err(StrataError::Branch(format!("index {} out of range", index)));
        }
        if self.branches.len() == 1 {
            return Err(StrataError::Branch(
                "cannot remove the only branch".to_string(),
            ));
        }
        if self.branches[index].open_files.load(Ordering::SeqCst) != 0 {
            return Err(StrataError::Branch(format!(
                "branch {} has open files",
                index
            )));
        }
        if index == 0 && self.branches[1].perms != BranchPerm::ReadWrite {
            return Err(StrataError::Branch(
                "leftmost branch must be writable".to_string(),
            ));
        }
        self.branches.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_dirs_spec() {
        let specs = parse_dirs_spec("/a=rw:/b=ro:/c").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].root, PathBuf::from("/a"));
        assert_eq!(specs[0].perms, BranchPerm::ReadWrite);
        assert_eq!(specs[1].perms, BranchPerm::ReadOnly);
        // default mode is rw
        assert_eq!(specs[2].perms, BranchPerm::ReadWrite);
    }

    #[test]
    fn test_parse_dirs_rejects_ro_top() {
        assert!(parse_dirs_spec("/a=ro:/b").is_err());
    }

    #[test]
    fn test_parse_dirs_rejects_empty() {
        assert!(parse_dirs_spec("").is_err());
        assert!(parse_dirs_spec(":::").is_err());
    }

    #[test]
    fn test_parse_dirs_rejects_bad_mode() {
        assert!(parse_dirs_spec("/a=rx").is_err());
    }

    #[test]
    fn test_parse_mount_options() {
        let specs = parse_mount_options("dirs=/a:/b=ro").unwrap();
        assert_eq!(specs.len(), 2);

        assert!(parse_mount_options("").is_err());
        assert!(parse_mount_options("dirs=/a,whatever=1").is_err());
        assert!(parse_mount_options("dirs=/a,dirs=/b").is_err());
    }

    #[test]
    fn test_table_rejects_overlap() {
        let tmp = tempdir().unwrap();
        let outer = tmp.path().join("outer");
        let inner = outer.join("inner");
        fs::create_dir_all(&inner).unwrap();

        let specs = vec![
            BranchSpec {
                root: outer.clone(),
                perms: BranchPerm::ReadWrite,
            },
            BranchSpec {
                root: inner,
                perms: BranchPerm::ReadOnly,
            },
        ];
        assert!(matches!(
            BranchTable::new(specs),
            Err(StrataError::Overlap(_, _))
        ));
    }

    #[test]
    fn test_table_rejects_missing_dir() {
        let tmp = tempdir().unwrap();
        let specs = vec![BranchSpec {
            root: tmp.path().join("nonexistent"),
            perms: BranchPerm::ReadWrite,
        }];
        assert!(BranchTable::new(specs).is_err());
    }

    #[test]
    fn test_table_rejects_file_branch() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, "x").unwrap();
        let specs = vec![BranchSpec {
            root: file,
            perms: BranchPerm::ReadWrite,
        }];
        assert!(BranchTable::new(specs).is_err());
    }

    fn two_branch_table() -> (tempfile::TempDir, BranchTable) {
        let tmp = tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        let table = BranchTable::new(vec![
            BranchSpec {
                root: a,
                perms: BranchPerm::ReadWrite,
            },
            BranchSpec {
                root: b,
                perms: BranchPerm::ReadOnly,
            },
        ])
        .unwrap();
        (tmp, table)
    }

    #[test]
    fn test_branch_ids_are_stable_across_add() {
        let (tmp, mut table) = two_branch_table();
        let id0 = table.branch(0).id;
        let id1 = table.branch(1).id;
        assert_ne!(id0, id1);

        let c = tmp.path().join("c");
        fs::create_dir_all(&c).unwrap();
        table.add_branch(0, &c, BranchPerm::ReadWrite).unwrap();

        // Existing branches keep their IDs at new positions.
        assert_eq!(table.branch(1).id, id0);
        assert_eq!(table.branch(2).id, id1);
        assert_ne!(table.branch(0).id, id0);
        assert_ne!(table.branch(0).id, id1);

        assert_eq!(table.branch_id_to_index(id0), Some(1));
        assert_eq!(table.branch_id_to_index(id1), Some(2));
    }

    #[test]
    fn test_remove_branch_with_open_files_refused() {
        let (_tmp, mut table) = two_branch_table();
        table.branchget(1);
        assert!(table.remove_branch(1).is_err());
        table.branchput(1);
        assert!(table.remove_branch(1).is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_refuses_ro_top() {
        let (_tmp, mut table) = two_branch_table();
        // Removing branch 0 would promote the read-only branch to the top.
        assert!(table.remove_branch(0).is_err());
    }
}
