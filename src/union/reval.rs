//! The generation-driven revalidation protocol.
//!
//! Staleness is detected lazily: every node carries the superblock
//! generation it was built under, and any strictly-newer superblock value
//! (or lower mtime/ctime evidence) forces a rebuild before the node is
//! used. Parents are always revalidated before children, so a rebuild can
//! trust its parent's fan-out.

use std::fs;
use std::path::PathBuf;

use fuser::FUSE_ROOT_ID;

use crate::union::convert::{ctime_of, metadata_to_fileattr};
use crate::union::lookup::{lookup_fanout, LookupOutcome};
use crate::union::types::{nlinks_for, LookupMode, Node};
use crate::union::{root_fanout, UnionFs};

impl UnionFs {
    /// Revalidate `ino` and every ancestor that needs it, parents first.
    /// Returns `ESTALE` if the object (or an ancestor) vanished from every
    /// branch; the caller must treat the node as gone.
    pub(crate) fn revalidate_chain(&self, ino: u64) -> Result<(), i32> {
        let sbgen = self.sbgen();

        // Collect the ancestors that need work, child to parent, stopping
        // at the first one that is already current. Only the immediate
        // parent gets the (costly) newer-lower probe; anything higher is
        // judged by generation alone.
        let mut chain: Vec<u64> = vec![ino];
        {
            let nodes = self.nodes.read();
            let mut cursor = nodes.peek(ino).ok_or(libc::ESTALE)?.parent;
            let mut probe_lower = true;
            while ino != FUSE_ROOT_ID {
                let node = nodes.peek(cursor).ok_or(libc::ESTALE)?;
                let needs =
                    node.gen != sbgen || (probe_lower && self.is_newer_lower(node));
                probe_lower = false;
                if !needs {
                    break;
                }
                chain.push(cursor);
                if cursor == FUSE_ROOT_ID {
                    break;
                }
                cursor = node.parent;
            }
        }

        // Revalidate parent to child.
        for &cursor in chain.iter().rev() {
            if !self.revalidate_one(cursor, sbgen)? {
                return Err(libc::ESTALE);
            }
        }
        Ok(())
    }

    /// Revalidate a single node whose parents are already valid. Returns
    /// whether the node is still live.
    fn revalidate_one(&self, ino: u64, sbgen: u32) -> Result<bool, i32> {
        if ino == FUSE_ROOT_ID {
            return self.revalidate_root(sbgen).map(|_| true);
        }

        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;

        if node.gen == sbgen && !self.is_newer_lower(&node) {
            // Nothing moved; just resync attributes from the top lower.
            // A failed resync means something raced out from under us, so
            // fall through to the full re-lookup.
            if self.refresh_attrs(ino).is_ok() {
                return Ok(true);
            }
        }

        tracing::debug!(
            "revalidating {:?} (gen {} vs sb {})",
            node.path,
            node.gen,
            sbgen
        );

        // A deleted-but-open node no longer exists in the namespace; there
        // is nothing to re-look-up. Keep it as-is for its open handles.
        if node.deleted {
            return Ok(true);
        }

        let parent = self.node_snapshot(node.parent).ok_or(libc::ESTALE)?;

        // Drop the current lower references and re-run lookup against the
        // (already revalidated) parent.
        let branches = self.branches.read();
        let outcome = lookup_fanout(
            &branches,
            &self.sioq,
            &parent.path,
            &parent.fanout,
            &node.name,
            LookupMode::Reval,
            None,
        )?;

        match outcome {
            LookupOutcome::Positive { fanout } => {
                // The object may have moved under a renamed ancestor; the
                // authoritative path is always parent path + name.
                let path: PathBuf = parent.path.join(&node.name);
                let top = fanout.start();
                let meta = fs::symlink_metadata(branches.path_on(top, &path))
                    .map_err(|_| libc::ESTALE)?;
                let mut attrs = metadata_to_fileattr(&meta, ino);
                attrs.nlink = nlinks_for(attrs.kind, &fanout);
                drop(branches);

                let mut nodes = self.nodes.write();
                if let Some(n) = nodes.get_mut(ino) {
                    n.fanout = fanout;
                    n.path = path;
                    n.attrs = attrs;
                    n.gen = sbgen;
                    n.stale = false;
                }
                Ok(true)
            }
            LookupOutcome::Negative { .. } => {
                drop(branches);
                // Positive re-lookup came back empty: the object is stale.
                // Evict it so the host drops the name and re-looks-up.
                tracing::debug!("{:?} vanished from every branch", node.path);
                let mut nodes = self.nodes.write();
                if let Some(n) = nodes.get_mut(ino) {
                    n.stale = true;
                }
                nodes.remove(ino);
                drop(nodes);
                self.drop_node_lock(ino);
                Ok(false)
            }
        }
    }

    /// The root never goes stale; a generation bump only means its fan-out
    /// must be rebuilt from the (possibly reshuffled) branch table.
    fn revalidate_root(&self, sbgen: u32) -> Result<(), i32> {
        let needs_rebuild = {
            let nodes = self.nodes.read();
            nodes
                .peek(FUSE_ROOT_ID)
                .map(|n| n.gen != sbgen)
                .unwrap_or(true)
        };
        if !needs_rebuild {
            return self.refresh_attrs(FUSE_ROOT_ID);
        }

        let branches = self.branches.read();
        let fanout = root_fanout(&branches).map_err(|_| libc::EIO)?;
        let meta = fs::metadata(branches.path_on(0, std::path::Path::new("")))
            .map_err(|_| libc::EIO)?;
        let mut attrs = metadata_to_fileattr(&meta, FUSE_ROOT_ID);
        attrs.nlink = nlinks_for(fuser::FileType::Directory, &fanout);
        drop(branches);

        let mut nodes = self.nodes.write();
        if let Some(n) = nodes.get_mut(FUSE_ROOT_ID) {
            n.fanout = fanout;
            n.attrs = attrs;
            n.gen = sbgen;
        }
        Ok(())
    }

    /// Has any lower object changed behind this node? Missing lowers and
    /// newer mtime/ctime both count; both mean our cached view lies.
    pub(crate) fn is_newer_lower(&self, node: &Node) -> bool {
        if node.ino == FUSE_ROOT_ID || node.deleted {
            return false;
        }
        let branches = self.branches.read();
        for b in node.fanout.populated() {
            let lref = node.fanout.lower(b).unwrap();
            if branches.get(b).is_none() {
                return true;
            }
            let meta = match fs::symlink_metadata(branches.path_on(b, &node.path)) {
                Ok(m) => m,
                Err(_) => return true,
            };
            let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            if mtime > lref.mtime || ctime_of(&meta) > lref.ctime {
                tracing::debug!("resyncing with lower ({:?} changed below)", node.path);
                return true;
            }
        }
        false
    }

    /// Copy attributes up from the top lower object, folding directory
    /// link counts across branches.
    pub(crate) fn refresh_attrs(&self, ino: u64) -> Result<(), i32> {
        let node = self.node_snapshot(ino).ok_or(libc::ESTALE)?;
        if node.deleted || node.fanout.is_negative() {
            return Ok(());
        }
        let branches = self.branches.read();
        let top = node.fanout.start();
        let meta = match fs::symlink_metadata(branches.path_on(top, &node.path)) {
            Ok(m) => m,
            Err(_) => return Err(libc::ESTALE),
        };
        drop(branches);

        let mut attrs = metadata_to_fileattr(&meta, ino);
        attrs.nlink = nlinks_for(attrs.kind, &node.fanout);

        let mut nodes = self.nodes.write();
        if let Some(n) = nodes.get_mut(ino) {
            n.attrs = attrs;
            // Record the freshly observed lower times so the newer-lower
            // probe stays quiet until the next real change.
            if let Some(lref) = n.fanout.lower(top) {
                let mut updated = *lref;
                updated.mtime = attrs.mtime;
                updated.ctime = attrs.ctime;
                n.fanout.set_lower(top, updated);
            }
        }
        Ok(())
    }
}
