//! The Put handler: materialize a tar stream below a directory.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tarcopy_utils::{clean_relative, join_relative, PathQuotedDisplay};
use tracing::instrument;

use crate::idmap::{IdMappings, IdPair};
use crate::mkdir::{ensure_directory, DEFAULT_DIR_MODE};
use crate::platform::{self, SpecialFile};
use crate::resolve::{resolve, resolve_parents};
use crate::{xattrs, Bulk, PutOptions, Request, Response};
use crate::Result;

use super::{apply_rename, pax_metadata};

/// Remove whatever is at `path`.  Non-empty directories are not removed.
fn remove_existing(path: &Utf8Path) -> std::io::Result<()> {
    if path.symlink_metadata()?.is_dir() {
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Run `create`; if something is already in the way, remove it and try
/// once more.
fn replacing<T>(
    path: &Utf8Path,
    mut create: impl FnMut() -> std::io::Result<T>,
) -> std::io::Result<T> {
    match create() {
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            tracing::trace!("Replacing {path}");
            remove_existing(path)?;
            create()
        }
        r => r,
    }
}

/// Directory times are applied once more after everything has been
/// written, since adding entries to a directory changes its mtime.
#[derive(Debug)]
struct DeferredTimes {
    path: Utf8PathBuf,
    atime: i64,
    mtime: i64,
}

struct Importer {
    root: Utf8PathBuf,
    target: Utf8PathBuf,
    opts: PutOptions,
    idmap: IdMappings,
    dir_owner: IdPair,
    dir_mode: u32,
    file_owner: Option<IdPair>,
    deferred: Vec<DeferredTimes>,
}

impl Importer {
    /// Where a hardlink's target is: absolute names are relative to the
    /// root, bare file names are next to the entry, and anything else is
    /// relative to the target directory.  Names within the archive go
    /// through the same renaming as entry names; `archived_name` is the
    /// entry's name before renaming.
    fn hardlink_target(&self, archived_name: &Utf8Path, link: &Utf8Path) -> Result<Utf8PathBuf> {
        let path = if link.is_absolute() {
            join_relative(&self.root, &clean_relative(link))
        } else {
            let archived = if link.parent().is_some_and(|p| p.as_str().is_empty()) {
                let dir = archived_name.parent().unwrap_or(Utf8Path::new(""));
                clean_relative(dir.join(link))
            } else {
                clean_relative(link)
            };
            let renamed = clean_relative(apply_rename(&self.opts.rename, &archived));
            join_relative(&self.target, &renamed)
        };
        resolve_parents(&self.root, &path, None)
    }

    fn import_entry(&mut self, entry: &mut tar::Entry<impl Read>) -> Result<()> {
        let header = entry.header().clone();
        let entry_type = header.entry_type();
        match entry_type {
            tar::EntryType::XGlobalHeader => return Ok(()),
            tar::EntryType::Char | tar::EntryType::Block if self.opts.ignore_devices => {
                tracing::debug!("Skipping device {}", PathQuotedDisplay::new(&entry.path()?));
                return Ok(());
            }
            _ => {}
        }
        let raw_name = Utf8PathBuf::try_from(entry.path()?.into_owned())?;
        let archived_name = clean_relative(&raw_name);
        let name = clean_relative(apply_rename(&self.opts.rename, &archived_name));
        let pax = pax_metadata(entry)?;
        let is_dir = entry_type == tar::EntryType::Directory;

        let mut owner = IdPair {
            uid: u32::try_from(header.uid()?)?,
            gid: u32::try_from(header.gid()?)?,
        };
        if !self.idmap.is_empty() {
            owner = self
                .idmap
                .to_host(owner)
                .with_context(|| format!("Mapping owner of {name}"))?;
        }
        let mut mode = header.mode()? & 0o7777;
        let (chown, chmod) = if is_dir {
            (self.opts.chown_dirs.map(|_| self.dir_owner), self.opts.chmod_dirs)
        } else {
            (self.file_owner, self.opts.chmod_files)
        };
        if let Some(chown) = chown {
            owner = chown;
        }
        if let Some(chmod) = chmod {
            mode = chmod & 0o7777;
        }

        let path = if name.as_str() == "." {
            if !is_dir {
                anyhow::bail!("Invalid name {raw_name:?} for a non-directory");
            }
            self.target.clone()
        } else {
            let parent_rel = name.parent().unwrap_or(Utf8Path::new(""));
            let parent = resolve(&self.root, &self.target.join(parent_rel), None)?;
            ensure_directory(&self.root, &parent, self.dir_owner, self.dir_mode)?;
            let file_name = name
                .file_name()
                .ok_or_else(|| anyhow!("Invalid name {raw_name:?}"))?;
            parent.join(file_name)
        };
        tracing::trace!("Extracting {name} ({entry_type:?}) to {path}");

        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut f = replacing(&path, || {
                    OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(&path)
                })?;
                let expected = entry.size();
                let n = std::io::copy(entry, &mut f)?;
                if n != expected {
                    anyhow::bail!("Short write for {name}: {n} of {expected} bytes");
                }
            }
            tar::EntryType::Link => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("Missing link target for {name}"))?;
                let link = Utf8PathBuf::try_from(link.into_owned())?;
                let source = self.hardlink_target(&archived_name, &link)?;
                replacing(&path, || std::fs::hard_link(&source, &path))
                    .with_context(|| format!("Linking {path} to {source}"))?;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("Missing link target for {name}"))?
                    .into_owned();
                replacing(&path, || std::os::unix::fs::symlink(&link, &path))?;
            }
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                let kind = match entry_type {
                    tar::EntryType::Char => SpecialFile::CharDevice,
                    tar::EntryType::Block => SpecialFile::BlockDevice,
                    _ => SpecialFile::Fifo,
                };
                let major = header.device_major()?.unwrap_or(0);
                let minor = header.device_minor()?.unwrap_or(0);
                replacing(&path, || platform::mknod(&path, kind, 0o600, major, minor))
                    .with_context(|| format!("Creating {path}"))?;
            }
            tar::EntryType::Directory => {
                match std::fs::create_dir(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        if !path.symlink_metadata()?.is_dir() {
                            remove_existing(&path)?;
                            std::fs::create_dir(&path)?;
                        }
                    }
                    Err(e) => return Err(e).with_context(|| format!("Creating {path}")),
                }
            }
            o => anyhow::bail!("Unsupported entry type {o:?} for {name}"),
        }

        // Ownership first: changing it clears setid bits and capabilities
        platform::lchown(&path, owner.uid, owner.gid)
            .with_context(|| format!("Setting owner of {path}"))?;
        if entry_type != tar::EntryType::Symlink {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o777))?;
            if mode & 0o7000 != 0 {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
            }
        }
        if !self.opts.strip_xattrs && !pax.xattrs.is_empty() {
            match xattrs::write_xattrs(&path, &pax.xattrs) {
                Ok(()) => {}
                Err(e) if self.opts.ignore_xattr_errors => {
                    tracing::debug!("Ignoring: {e:#}");
                }
                Err(e) => return Err(e),
            }
        }

        let mtime = match pax.mtime {
            Some(t) => t,
            None => i64::try_from(header.mtime()?)?,
        };
        let atime = pax
            .atime
            .or_else(|| {
                header
                    .as_gnu()
                    .and_then(|g| g.atime().ok())
                    .and_then(|t| i64::try_from(t).ok())
            })
            .unwrap_or(0);
        let atime = if atime == 0 || atime < mtime { mtime } else { atime };
        platform::set_times(&path, atime, mtime)
            .with_context(|| format!("Setting times of {path}"))?;
        if is_dir {
            self.deferred.push(DeferredTimes { path, atime, mtime });
        }
        Ok(())
    }

    fn run(mut self, src: &mut dyn Read) -> Result<()> {
        let mut archive = tar::Archive::new(src);
        for entry in archive.entries()? {
            let mut entry = entry?;
            self.import_entry(&mut entry)?;
        }
        // Consume any padding after the end-of-archive marker, so that a
        // writer on the other end of a pipe doesn't see it close early.
        let mut src = archive.into_inner();
        std::io::copy(&mut src, &mut std::io::sink())?;
        for d in self.deferred.iter().rev() {
            platform::set_times(&d.path, d.atime, d.mtime)
                .with_context(|| format!("Setting times of {}", d.path))?;
        }
        Ok(())
    }
}

/// Handle a normalized Put request.  The target directory is created
/// now; the archive is read by the returned [`Bulk::Put`].
#[instrument(level = "debug", skip_all)]
pub(crate) fn handle_put(req: &Request) -> Result<(Response, Bulk)> {
    let opts = &req.put_options;
    let idmap = req.get_idmappings();
    let mut dir_owner = opts.chown_dirs.unwrap_or_default();
    let dir_mode = opts.chmod_dirs.unwrap_or(DEFAULT_DIR_MODE);
    let mut file_owner = opts.chown_files;
    if !idmap.is_empty() {
        dir_owner = idmap.to_host(dir_owner)?;
        file_owner = file_owner.map(|o| idmap.to_host(o)).transpose()?;
    }

    let target = resolve(&req.root, &req.directory, None)?;
    match target.symlink_metadata() {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => anyhow::bail!("{} is not a directory", req.caller_path(&target)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            ensure_directory(&req.root, &target, dir_owner, dir_mode)?;
        }
        Err(e) => return Err(e).with_context(|| format!("Examining {target}")),
    }
    tracing::debug!("Extracting into {}", PathQuotedDisplay::new(&target));

    let importer = Importer {
        root: req.root.clone(),
        target,
        opts: opts.clone(),
        idmap,
        dir_owner,
        dir_mode,
        file_owner,
        deferred: Vec::new(),
    };
    let bulk = Bulk::Put(Box::new(move |r: &mut dyn Read| importer.run(r)));
    Ok((Response::default(), bulk))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::RequestKind;

    fn ids() -> IdPair {
        IdPair {
            uid: rustix::process::geteuid().as_raw(),
            gid: rustix::process::getegid().as_raw(),
        }
    }

    fn header(entry_type: tar::EntryType, mode: u32, mtime: u64) -> tar::Header {
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(entry_type);
        h.set_mode(mode);
        h.set_uid(ids().uid.into());
        h.set_gid(ids().gid.into());
        h.set_mtime(mtime);
        h.set_size(0);
        h
    }

    fn put(root: &Utf8Path, dir: &str, data: &[u8], f: impl FnOnce(&mut PutOptions)) -> Result<()> {
        let mut req = Request::new(RequestKind::Put, root, dir);
        req.put_options.chown_dirs = Some(ids());
        f(&mut req.put_options);
        req.normalize(None)?;
        let (_, bulk) = handle_put(&req)?;
        let Bulk::Put(bulk) = bulk else {
            anyhow::bail!("Expected a Put transfer");
        };
        let mut data = data;
        let r: &mut dyn Read = &mut data;
        bulk(r)
    }

    #[test]
    fn test_put() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;

        let mut b = tar::Builder::new(Vec::new());
        b.append_data(&mut header(tar::EntryType::Directory, 0o750, 1000), "d/", std::io::empty())?;
        let mut h = header(tar::EntryType::Regular, 0o4755, 2000);
        h.set_size(5);
        b.append_data(&mut h, "d/f", &b"hello"[..])?;
        // The link shares the file's inode, and so its mode
        b.append_link(&mut header(tar::EntryType::Link, 0o4755, 2000), "d/g", "f")?;
        b.append_link(&mut header(tar::EntryType::Symlink, 0o777, 2000), "d/s", "/etc/passwd")?;
        b.append_data(&mut header(tar::EntryType::Fifo, 0o640, 2000), "d/p", std::io::empty())?;
        // Parent directories are created as needed
        let mut h = header(tar::EntryType::Regular, 0o644, 2000);
        h.set_size(1);
        b.append_data(&mut h, "x/y/z", &b"z"[..])?;
        let data = b.into_inner()?;

        put(&root, "sub", &data, |_| {})?;
        let t = root.join("sub");
        let meta = t.join("d/f").symlink_metadata()?;
        assert_eq!(meta.mode() & 0o7777, 0o4755);
        assert_eq!(std::fs::read_to_string(t.join("d/f"))?, "hello");
        assert_eq!(meta.ino(), t.join("d/g").symlink_metadata()?.ino());
        assert_eq!(t.join("d/s").read_link_utf8()?, "/etc/passwd");
        let d = t.join("d").symlink_metadata()?;
        assert_eq!(d.mtime(), 1000);
        assert_eq!(d.mode() & 0o7777, 0o750);
        assert!(t.join("x/y").is_dir());

        // Extracting again replaces what's there
        put(&root, "sub", &data, |_| {})?;
        assert_eq!(std::fs::read_to_string(t.join("d/f"))?, "hello");
        Ok(())
    }

    #[test]
    fn test_put_escapes_are_contained() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().join("root"))?;
        std::fs::create_dir(&root)?;
        std::os::unix::fs::symlink("/", root.join("up"))?;

        let mut b = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Regular, 0o644, 2000);
        h.set_size(1);
        b.append_data(&mut h, "up/../../escaped", &b"x"[..])?;
        let mut h = header(tar::EntryType::Regular, 0o644, 2000);
        h.set_size(1);
        b.append_data(&mut h, "up/via-link", &b"x"[..])?;
        let data = b.into_inner()?;
        put(&root, ".", &data, |_| {})?;
        assert!(root.join("escaped").exists());
        assert!(root.join("via-link").exists());
        assert!(!td.path().join("escaped").exists());
        Ok(())
    }

    #[test]
    fn test_put_rename_applies_to_hardlinks() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let mut b = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Regular, 0o644, 2000);
        h.set_size(1);
        b.append_data(&mut h, "a/x", &b"x"[..])?;
        b.append_link(&mut header(tar::EntryType::Link, 0o644, 2000), "b/y", "a/x")?;
        b.append_link(&mut header(tar::EntryType::Link, 0o644, 2000), "a/z", "x")?;
        let data = b.into_inner()?;
        put(&root, ".", &data, |o| {
            o.rename.insert("a".into(), "c".into());
        })?;
        let ino = root.join("c/x").symlink_metadata()?.ino();
        assert_eq!(root.join("b/y").symlink_metadata()?.ino(), ino);
        assert_eq!(root.join("c/z").symlink_metadata()?.ino(), ino);
        assert!(!root.join("a").exists());
        Ok(())
    }

    #[test]
    fn test_put_id_mapping() -> Result<()> {
        use crate::idmap::IdMap;
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let mut b = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Regular, 0o644, 2000);
        h.set_uid(1000);
        h.set_gid(2000);
        b.append_data(&mut h, "f", std::io::empty())?;
        let data = b.into_inner()?;
        let maps = |o: &mut PutOptions| {
            o.uid_map = vec![IdMap {
                container_id: 1000,
                host_id: ids().uid,
                size: 1,
            }];
            o.gid_map = vec![IdMap {
                container_id: 2000,
                host_id: ids().gid,
                size: 1,
            }];
            // Directory owners are container IDs too
            o.chown_dirs = Some(IdPair {
                uid: 1000,
                gid: 2000,
            });
        };
        put(&root, "sub", &data, maps)?;
        let meta = root.join("sub/f").symlink_metadata()?;
        assert_eq!((meta.uid(), meta.gid()), (ids().uid, ids().gid));

        let mut b = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Regular, 0o644, 2000);
        h.set_uid(5);
        b.append_data(&mut h, "g", std::io::empty())?;
        let data = b.into_inner()?;
        let e = put(&root, "sub", &data, maps).unwrap_err();
        assert!(format!("{e:#}").contains("Container UID 5 has no host mapping"));
        Ok(())
    }

    fn with_xattr(entry_type: tar::EntryType, name: &str, link: Option<&str>) -> Result<Vec<u8>> {
        let mut b = tar::Builder::new(Vec::new());
        b.append_pax_extensions([("SCHILY.xattr.user.test", &b"v"[..])])?;
        let mut h = header(entry_type, 0o644, 2000);
        match link {
            Some(link) => b.append_link(&mut h, name, link)?,
            None => b.append_data(&mut h, name, std::io::empty())?,
        }
        Ok(b.into_inner()?)
    }

    #[test]
    fn test_put_xattrs() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let marker = root.join("marker");
        std::fs::write(&marker, "")?;
        if let Err(e) = xattr::set(&marker, "user.marker", b"1") {
            eprintln!("skipping, no user xattrs: {e}");
            return Ok(());
        }

        put(&root, ".", &with_xattr(tar::EntryType::Regular, "f", None)?, |_| {})?;
        assert_eq!(xattr::get(root.join("f"), "user.test")?, Some(b"v".to_vec()));
        put(&root, ".", &with_xattr(tar::EntryType::Regular, "g", None)?, |o| {
            o.strip_xattrs = true
        })?;
        assert_eq!(xattr::get(root.join("g"), "user.test")?, None);

        // Linux doesn't allow user xattrs on symlinks
        let data = with_xattr(tar::EntryType::Symlink, "s", Some("f"))?;
        assert!(put(&root, ".", &data, |_| {}).is_err());
        put(&root, ".", &data, |o| o.ignore_xattr_errors = true)?;
        assert_eq!(root.join("s").read_link_utf8()?, "f");
        Ok(())
    }

    #[test]
    fn test_put_rename_and_devices() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let mut b = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Char, 0o666, 2000);
        h.set_device_major(1)?;
        h.set_device_minor(3)?;
        b.append_data(&mut h, "null", std::io::empty())?;
        let mut h = header(tar::EntryType::Regular, 0o644, 2000);
        h.set_size(1);
        b.append_data(&mut h, "a/b", &b"x"[..])?;
        let data = b.into_inner()?;
        put(&root, ".", &data, |o| {
            o.ignore_devices = true;
            o.rename.insert("a".into(), "c".into());
        })?;
        assert!(!root.join("null").exists());
        assert!(root.join("c/b").exists());
        Ok(())
    }
}
