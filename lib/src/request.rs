//! The request and response records exchanged with the handlers.
//!
//! These are also the wire format of the chroot helper's control channel,
//! one JSON object per line.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tarcopy_utils::{clean, clean_relative, join_relative, relative_subdirectory};

use crate::idmap::{IdMap, IdMappings, IdPair};
use crate::Result;

/// The operation a [`Request`] asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    /// Report metadata about glob matches.
    #[default]
    Stat,
    /// Archive glob matches into a tar stream.
    Get,
    /// Extract a tar stream into the directory.
    Put,
    /// Resolve the directory through symlinks.
    Eval,
    /// Create the directory and any missing parents.
    Mkdir,
    /// End of a session with the chroot helper.
    Quit,
}

/// Options for [`RequestKind::Stat`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatOptions {
    /// Set [`StatForItem::is_archive`] for regular files.
    pub check_for_archives: bool,
    /// Exclusion patterns, see [`crate::exclude::ExcludeMatcher`].
    pub excludes: Vec<String>,
}

/// Options for [`RequestKind::Get`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetOptions {
    /// UID mapping; emitted headers carry container IDs.
    pub uid_map: Vec<IdMap>,
    /// GID mapping; emitted headers carry container IDs.
    pub gid_map: Vec<IdMap>,
    /// Exclusion patterns.
    pub excludes: Vec<String>,
    /// Inline the entries of archives instead of the archive files.
    pub expand_archives: bool,
    /// Clear setuid, setgid and sticky bits.
    pub strip_setid_bits: bool,
    /// Don't emit extended attributes.
    pub strip_xattrs: bool,
    /// Prefix entries found in a matched directory with its name.
    pub keep_directory_names: bool,
    /// Skip content we lack permission to read.
    pub ignore_unreadable: bool,
    /// Emit a matched symlink as a link rather than what it points to.
    pub no_deref_symlinks: bool,
    /// Owner for emitted directories.
    pub chown_dirs: Option<IdPair>,
    /// Permission bits for emitted directories.
    pub chmod_dirs: Option<u32>,
    /// Owner for emitted non-directories.
    pub chown_files: Option<IdPair>,
    /// Permission bits for emitted non-directories.
    pub chmod_files: Option<u32>,
    /// Entry names to rewrite; a key also matches a leading directory.
    pub rename: BTreeMap<String, String>,
}

/// Options for [`RequestKind::Put`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PutOptions {
    /// UID mapping; incoming headers carry container IDs.
    pub uid_map: Vec<IdMap>,
    /// GID mapping; incoming headers carry container IDs.
    pub gid_map: Vec<IdMap>,
    /// Owner for directories, both extracted and implicitly created.
    pub chown_dirs: Option<IdPair>,
    /// Permission bits for directories, both extracted and implicitly created.
    pub chmod_dirs: Option<u32>,
    /// Owner for extracted non-directories.
    pub chown_files: Option<IdPair>,
    /// Permission bits for extracted non-directories.
    pub chmod_files: Option<u32>,
    /// Don't set extended attributes.
    pub strip_xattrs: bool,
    /// Carry on if setting an extended attribute fails.
    pub ignore_xattr_errors: bool,
    /// Skip character and block devices.
    pub ignore_devices: bool,
    /// Entry names to rewrite; a key also matches a leading directory.
    pub rename: BTreeMap<String, String>,
}

/// Options for [`RequestKind::Mkdir`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MkdirOptions {
    /// UID mapping applied to `chown_new`.
    pub uid_map: Vec<IdMap>,
    /// GID mapping applied to `chown_new`.
    pub gid_map: Vec<IdMap>,
    /// Owner for created directories, as a container ID.
    pub chown_new: Option<IdPair>,
    /// Permission bits for created directories.
    pub chmod_new: Option<u32>,
}

/// A single operation against a tree rooted at `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// What to do.
    pub kind: RequestKind,
    /// Absolute path of the directory treated as `/`.
    #[serde(default)]
    pub root: Utf8PathBuf,
    /// Base for relative globs; relative values are taken from `root`.
    #[serde(default)]
    pub directory: Utf8PathBuf,
    /// Patterns to match, for [`RequestKind::Stat`] and [`RequestKind::Get`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub globs: Vec<String>,
    /// Used by [`RequestKind::Stat`].
    #[serde(default)]
    pub stat_options: StatOptions,
    /// Used by [`RequestKind::Get`].
    #[serde(default)]
    pub get_options: GetOptions,
    /// Used by [`RequestKind::Put`].
    #[serde(default)]
    pub put_options: PutOptions,
    /// Used by [`RequestKind::Mkdir`].
    #[serde(default)]
    pub mkdir_options: MkdirOptions,

    /// The globs as the caller gave them, before normalization.
    #[serde(skip)]
    pub(crate) preserved_globs: Vec<String>,
    /// Where `/` of the view we work in is, as the caller sees it.
    #[serde(skip)]
    pub(crate) root_prefix: Utf8PathBuf,
}

impl Request {
    /// Create a request of the given kind.
    pub fn new(
        kind: RequestKind,
        root: impl Into<Utf8PathBuf>,
        directory: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            kind,
            root: root.into(),
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Rewrite `root`, `directory` and `globs` into absolute paths in the
    /// view the handlers work in: the host's, or after `chroot(chroot_root)`
    /// the chroot's.  The caller's values are kept for reporting names.
    pub(crate) fn normalize(&mut self, chroot_root: Option<&Utf8Path>) -> Result<()> {
        if !self.root.is_absolute() {
            anyhow::bail!("Root {} is not an absolute path", self.root);
        }
        let root = clean(&self.root);
        self.preserved_globs = self.globs.clone();
        let view_root = match chroot_root {
            Some(r) => {
                self.root_prefix = clean(r);
                Utf8PathBuf::from("/")
            }
            None => {
                self.root_prefix = Utf8PathBuf::from("/");
                root.clone()
            }
        };

        let dir_rel = if self.directory.is_absolute() {
            relative_subdirectory(&root, &self.directory)
                .with_context(|| format!("Directory {} is outside root {root}", self.directory))?
        } else {
            clean_relative(&self.directory)
        };

        let globs = self
            .globs
            .iter()
            .map(|glob| {
                let g = Utf8Path::new(glob);
                let rel = if g.is_absolute() {
                    relative_subdirectory(&root, g)
                        .with_context(|| format!("Glob {glob:?} is outside root {root}"))?
                } else {
                    clean_relative(dir_rel.join(g))
                };
                Ok(join_relative(&view_root, &rel).into_string())
            })
            .collect::<Result<Vec<_>>>()?;

        self.directory = join_relative(&view_root, &dir_rel);
        self.globs = globs;
        self.root = view_root;
        Ok(())
    }

    /// Translate an absolute path in the working view back to the caller's.
    pub(crate) fn caller_path(&self, path: &Utf8Path) -> Utf8PathBuf {
        match relative_subdirectory("/", path) {
            Ok(rel) => join_relative(&self.root_prefix, &rel),
            Err(_) => path.to_owned(),
        }
    }

    /// The name under which a match of glob number `index` is reported:
    /// absolute if the caller's glob was, otherwise relative to the
    /// directory (or failing that, the root).
    pub(crate) fn reported_name(&self, index: usize, path: &Utf8Path) -> String {
        let absolute = self
            .preserved_globs
            .get(index)
            .is_some_and(|g| g.starts_with('/'));
        if absolute {
            return self.caller_path(path).into_string();
        }
        relative_subdirectory(&self.directory, path)
            .or_else(|_| relative_subdirectory(&self.root, path))
            .map(Utf8PathBuf::into_string)
            .unwrap_or_else(|_| path.to_string())
    }

    /// A path below the root, relative to it.
    pub(crate) fn relative_to_root(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        relative_subdirectory(&self.root, path)
    }

    pub(crate) fn get_idmappings(&self) -> IdMappings {
        let (uid, gid) = match self.kind {
            RequestKind::Get => (&self.get_options.uid_map, &self.get_options.gid_map),
            RequestKind::Put => (&self.put_options.uid_map, &self.put_options.gid_map),
            RequestKind::Mkdir => (&self.mkdir_options.uid_map, &self.mkdir_options.gid_map),
            _ => return IdMappings::default(),
        };
        IdMappings::new(uid.clone(), gid.clone())
    }
}

/// Metadata about one glob match.  For a symlink, everything but
/// `is_symlink` and `immediate_target` describes what it points to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatForItem {
    /// The reported name.
    pub name: String,
    /// Set if the item could not be examined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// The raw `st_mode`, including the file type bits.
    pub mode: u32,
    /// Modification time.
    pub mod_time: Option<DateTime<Utc>>,
    /// The match itself is a symlink.
    pub is_symlink: bool,
    /// A directory.
    pub is_dir: bool,
    /// A regular file.
    pub is_regular: bool,
    /// The file is a tar archive, possibly compressed.
    pub is_archive: bool,
    /// The link text, for a symlink.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate_target: Option<String>,
}

/// Stat results for one glob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsForGlob {
    /// The glob as the caller gave it.
    pub glob: String,
    /// Set if the glob is malformed or matched nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reported names of the matches, in match order.
    pub globbed: Vec<String>,
    /// Per-match details, keyed by reported name.
    pub results: BTreeMap<String, StatForItem>,
}

/// The reply to a [`Request`].  Get and Put deliver their payload out of
/// band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Response {
    /// Set if the request failed as a whole.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// For [`RequestKind::Stat`], one entry per glob.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stat: Vec<StatsForGlob>,
    /// For [`RequestKind::Eval`], the resolved directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval: Option<Utf8PathBuf>,
}

impl Response {
    pub(crate) fn from_error(e: &anyhow::Error) -> Self {
        Self {
            error: Some(format!("{e:#}")),
            ..Default::default()
        }
    }

    /// Turn an error reported by the handler into an `Err`.
    pub(crate) fn into_result(self) -> Result<Self> {
        match self.error {
            Some(e) => Err(anyhow!(e)),
            None => Ok(self),
        }
    }
}

/// The first record a chroot helper receives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionOptions {
    /// The directory to chroot into.
    pub(crate) root: Utf8PathBuf,
    /// The caller's directory; informational.
    pub(crate) directory: Utf8PathBuf,
}

/// The data transfer a successful Get or Put continues with, after its
/// response has been delivered.
pub(crate) enum Bulk {
    /// Write a tar stream.
    Get(Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>),
    /// Read a tar stream.
    Put(Box<dyn FnOnce(&mut dyn Read) -> Result<()> + Send>),
}

impl std::fmt::Debug for Bulk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bulk::Get(_) => f.write_str("Bulk::Get"),
            Bulk::Put(_) => f.write_str("Bulk::Put"),
        }
    }
}
