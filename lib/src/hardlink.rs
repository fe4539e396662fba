//! Remember which archive name each multiply-linked inode was first
//! written as, so later names for it become hardlink entries.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;

use camino::{Utf8Path, Utf8PathBuf};

/// Maps (device, inode) to the first name emitted for it.
#[derive(Debug, Default)]
pub struct HardlinkTracker {
    seen: HashMap<(u64, u64), Utf8PathBuf>,
}

impl HardlinkTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// If the file described by `meta` was already emitted, return the
    /// name it was emitted under; otherwise record it as `name`.
    pub fn check(&mut self, meta: &std::fs::Metadata, name: &Utf8Path) -> Option<Utf8PathBuf> {
        self.check_inode(meta.dev(), meta.ino(), meta.nlink(), name)
    }

    /// Files with a single link are never tracked, and neither is inode 0,
    /// which some virtual filesystems report for everything.
    fn check_inode(
        &mut self,
        dev: u64,
        ino: u64,
        nlink: u64,
        name: &Utf8Path,
    ) -> Option<Utf8PathBuf> {
        if nlink <= 1 || ino == 0 {
            return None;
        }
        match self.seen.entry((dev, ino)) {
            std::collections::hash_map::Entry::Occupied(e) => Some(e.get().clone()),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(name.to_owned());
                None
            }
        }
    }
}
