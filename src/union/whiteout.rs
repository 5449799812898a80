//! Whiteout and opacity naming for the union namespace.
//!
//! A "whiteout" is a marker file on an upper branch that hides the same name
//! on every lower branch: for a file named `foo` it is an empty regular file
//! named `.wh.foo` in the same directory. A directory containing the marker
//! `.wh.__dir_opaque` is opaque: lookup will not descend past the branch
//! holding it for any of the directory's contents.
//!
//! Both name forms are internal to the union and must never be visible to,
//! or addressable by, callers; operations on them fail with `EPERM` before
//! any branch is consulted.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// The prefix marking whiteout files on a branch.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker file that makes the directory containing it opaque. Starts with
/// the whiteout prefix so it is blocked by name validation like any other
/// internal name.
pub const DIR_OPAQUE_NAME: &str = "__dir_opaque";
pub const DIR_OPAQUE: &str = ".wh.__dir_opaque";

/// Prefix for silly-renamed open-but-deleted files awaiting copy-up.
pub const SILLY_PREFIX: &str = ".stratafs";

/// Process-wide counter feeding the silly-rename template.
static SILLY_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Whiteout handling utilities. All whiteout naming goes through this type
/// so the on-branch encoding is defined in exactly one place.
pub struct Whiteout;

impl Whiteout {
    /// Generate the whiteout marker filename for a given filename:
    /// `foo` becomes `.wh.foo`.
    pub fn marker_name(name: &OsStr) -> OsString {
        let mut whiteout_name = OsString::from(WHITEOUT_PREFIX);
        whiteout_name.push(name);
        whiteout_name
    }

    /// The whiteout marker path for `dir/name`.
    pub fn marker_path(dir: &Path, name: &OsStr) -> PathBuf {
        dir.join(Self::marker_name(name))
    }

    /// Check if a filename is a whiteout marker (starts with `.wh.`).
    pub fn is_marker(name: &OsStr) -> bool {
        name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
    }

    /// Extract the hidden filename from a whiteout marker name:
    /// `.wh.foo` yields `foo`. Returns `None` for non-marker names.
    pub fn extract_target(marker: &OsStr) -> Option<OsString> {
        let bytes = marker.as_bytes();
        let prefix = WHITEOUT_PREFIX.as_bytes();
        if bytes.starts_with(prefix) {
            Some(OsString::from(OsStr::from_bytes(&bytes[prefix.len()..])))
        } else {
            None
        }
    }

    /// The opacity marker path inside `dir`.
    pub fn opaque_path(dir: &Path) -> PathBuf {
        dir.join(DIR_OPAQUE)
    }
}

/// A name is valid for user-visible operations unless it begins with the
/// whiteout prefix or names the opacity marker. Lookups and mutations on
/// invalid names fail with `EPERM` without touching any branch.
pub fn is_valid_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    if bytes.starts_with(WHITEOUT_PREFIX.as_bytes()) {
        return false;
    }
    if bytes == DIR_OPAQUE_NAME.as_bytes() {
        return false;
    }
    true
}

/// Generate the next candidate name for a silly-renamed file:
/// `.stratafs<ino-hex><counter-hex>` with the inode number zero-padded to
/// 2 * size_of(u64) digits and the counter to 2 * size_of(u32) digits.
pub fn silly_name(ino: u64) -> OsString {
    let counter = SILLY_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    OsString::from(format!("{}{:016x}{:08x}", SILLY_PREFIX, ino, counter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_name() {
        assert_eq!(
            Whiteout::marker_name(OsStr::new("test.txt")),
            OsString::from(".wh.test.txt")
        );
    }

    #[test]
    fn test_is_marker() {
        assert!(Whiteout::is_marker(OsStr::new(".wh.foo")));
        assert!(Whiteout::is_marker(OsStr::new(".wh.bar.txt")));
        assert!(Whiteout::is_marker(OsStr::new(DIR_OPAQUE)));
        assert!(!Whiteout::is_marker(OsStr::new("foo")));
        assert!(!Whiteout::is_marker(OsStr::new(".hidden")));
        assert!(!Whiteout::is_marker(OsStr::new("wh.foo")));
    }

    #[test]
    fn test_extract_target() {
        assert_eq!(
            Whiteout::extract_target(OsStr::new(".wh.foo")),
            Some(OsString::from("foo"))
        );
        assert_eq!(Whiteout::extract_target(OsStr::new("foo")), None);
        assert_eq!(Whiteout::extract_target(OsStr::new(".hidden")), None);
    }

    #[test]
    fn test_name_validity() {
        assert!(is_valid_name(OsStr::new("hello")));
        assert!(is_valid_name(OsStr::new(".hidden")));
        // Any name with the whiteout prefix is blocked, four bytes exactly.
        assert!(!is_valid_name(OsStr::new(".wh.hello")));
        assert!(!is_valid_name(OsStr::new(".wh.")));
        assert!(!is_valid_name(OsStr::new(DIR_OPAQUE)));
        // The bare marker name without the prefix is reserved too.
        assert!(!is_valid_name(OsStr::new(DIR_OPAQUE_NAME)));
    }

    #[test]
    fn test_silly_name_shape() {
        let name = silly_name(0xabcd);
        let s = name.to_string_lossy().into_owned();
        assert!(s.starts_with(SILLY_PREFIX));
        // prefix + 16 hex digits of inode + 8 hex digits of counter
        assert_eq!(s.len(), SILLY_PREFIX.len() + 16 + 8);
        assert!(s.contains("000000000000abcd"));
    }

    #[test]
    fn test_silly_name_advances() {
        let a = silly_name(1);
        let b = silly_name(1);
        assert_ne!(a, b);
    }
}
