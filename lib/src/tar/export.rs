//! The Get handler: serialize glob matches into a tar stream.

use std::cell::Cell;
use std::fs::{File, Metadata};
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::rc::Rc;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tarcopy_utils::clean_relative;
use tracing::instrument;

use crate::exclude::ExcludeMatcher;
use crate::hardlink::HardlinkTracker;
use crate::idmap::{IdMappings, IdPair};
use crate::resolve::resolve_with_limit;
use crate::stat::{expand_glob, no_matches, stat_globs, GlobMatch};
use crate::{archive, xattrs, Bulk, GetOptions, Request, Response};
use crate::Result;

use super::{apply_rename, copy_entry, xattrs_to_pax};

/// How many symlinks we chase for a single matched item.
const MAX_ITEM_SYMLINK_FOLLOWS: usize = 16;

/// Passes writes through until the archive is abandoned, after which every
/// write fails.  This keeps the builder from appending an end-of-archive
/// marker to a truncated stream when it is dropped.
struct AbortOnError<W> {
    inner: W,
    aborted: Rc<Cell<bool>>,
}

impl<W: Write> Write for AbortOnError<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.aborted.get() {
            return Err(std::io::Error::other("archive aborted"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.aborted.get() {
            return Err(std::io::Error::other("archive aborted"));
        }
        self.inner.flush()
    }
}

fn is_permission_denied(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::PermissionDenied
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

fn entry_type_for(meta: &Metadata) -> Option<tar::EntryType> {
    let ft = meta.file_type();
    let t = if ft.is_dir() {
        tar::EntryType::Directory
    } else if ft.is_symlink() {
        tar::EntryType::Symlink
    } else if ft.is_file() {
        tar::EntryType::Regular
    } else if ft.is_fifo() {
        tar::EntryType::Fifo
    } else if ft.is_char_device() {
        tar::EntryType::Char
    } else if ft.is_block_device() {
        tar::EntryType::Block
    } else {
        return None;
    };
    Some(t)
}

/// The name to record for a hardlink to `prior` emitted as `name`: just
/// the file name when both are in the same directory.
fn hardlink_name(prior: &Utf8Path, name: &Utf8Path) -> Utf8PathBuf {
    let prior_parent = prior.parent().unwrap_or(Utf8Path::new(""));
    let parent = name.parent().unwrap_or(Utf8Path::new(""));
    if prior_parent == parent {
        return prior.file_name().map(Utf8PathBuf::from).unwrap_or_else(|| prior.to_owned());
    }
    if prior_parent.as_str().is_empty() {
        return Utf8Path::new(".").join(prior);
    }
    prior.to_owned()
}

struct Exporter<'a, W: Write> {
    req: &'a Request,
    opts: &'a GetOptions,
    excludes: &'a ExcludeMatcher,
    idmap: IdMappings,
    hardlinks: HardlinkTracker,
    out: tar::Builder<W>,
    emitted: usize,
}

impl<W: Write> Exporter<'_, W> {
    fn rel(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        self.req.relative_to_root(path)
    }

    /// Chase symlinks from `path` as if the root were `/`.
    fn follow_symlinks(&self, path: Utf8PathBuf, meta: Metadata) -> Result<(Utf8PathBuf, Metadata)> {
        if !meta.file_type().is_symlink() {
            return Ok((path, meta));
        }
        let resolved = resolve_with_limit(
            &self.req.root,
            &path,
            Some(self.excludes),
            MAX_ITEM_SYMLINK_FOLLOWS,
        )?;
        let meta = resolved
            .symlink_metadata()
            .with_context(|| format!("Examining {resolved}"))?;
        Ok((resolved, meta))
    }

    #[context("Archiving {}", item.path)]
    fn export_item(&mut self, item: &GlobMatch) -> Result<()> {
        let meta = match item.real.symlink_metadata() {
            Ok(m) => m,
            Err(e) if self.opts.ignore_unreadable && is_permission_denied(&e) => {
                tracing::debug!("Skipping unreadable {}", item.path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        // The root itself has no name of its own, whether or not we
        // are chrooted into it.
        let item_name = if self.rel(&item.path)?.as_str() == "." {
            Utf8PathBuf::new()
        } else {
            item.path
                .file_name()
                .map(Utf8PathBuf::from)
                .unwrap_or_default()
        };
        let (path, meta) = if self.opts.no_deref_symlinks {
            (item.real.clone(), meta)
        } else {
            self.follow_symlinks(item.real.clone(), meta)?
        };

        if meta.is_dir() {
            let prefix = if self.opts.keep_directory_names {
                item_name
            } else {
                Utf8PathBuf::new()
            };
            return self.export_tree(&path, &prefix);
        }

        if self.excludes.matches(&self.rel(&path)?) {
            tracing::trace!("Excluded: {path}");
            return Ok(());
        }
        let link_text = if meta.file_type().is_symlink() {
            Some(path.read_link_utf8()?)
        } else {
            None
        };
        self.emit_one(&meta, link_text.as_deref(), &item_name, &path)
    }

    /// Walk a directory without skipping excluded subtrees, since a later
    /// `!` pattern may re-include something inside them.
    fn export_tree(&mut self, dir: &Utf8Path, prefix: &Utf8Path) -> Result<()> {
        let walker = walkdir::WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    match e.io_error() {
                        Some(ioe) if self.opts.ignore_unreadable && is_permission_denied(ioe) => {
                            tracing::debug!("Skipping unreadable {path}");
                            continue;
                        }
                        Some(ioe) if is_not_found(ioe) => {
                            tracing::warn!("{path} vanished while archiving it");
                            continue;
                        }
                        _ => return Err(e).context("Walking directory"),
                    }
                }
            };
            let path = Utf8Path::from_path(entry.path())
                .ok_or_else(|| anyhow!("Non-UTF-8 path {:?}", entry.path()))?;
            let walked = path.strip_prefix(dir)?;
            let name = clean_relative(prefix.join(walked));
            if name.as_str() == "." {
                continue;
            }
            if self.excludes.matches(&self.rel(path)?) {
                tracing::trace!("Excluded: {path}");
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) if e.io_error().is_some_and(is_not_found) => {
                    tracing::warn!("{path} vanished while archiving it");
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("Examining {path}")),
            };
            if meta.file_type().is_socket() {
                tracing::warn!("Skipping socket {path}");
                continue;
            }
            let link_text = if meta.file_type().is_symlink() {
                Some(path.read_link_utf8()?)
            } else {
                None
            };
            self.emit_one(&meta, link_text.as_deref(), &name, path)?;
        }
        Ok(())
    }

    /// Inline the entries of an archive.  Its end-of-archive marker is not
    /// copied, as it would end our own stream.
    fn expand_archive(&mut self, path: &Utf8Path) -> Result<()> {
        tracing::debug!("Expanding archive {path}");
        let mut archive = archive::open_archive(path)?;
        for entry in archive.entries()? {
            copy_entry(entry?, &mut self.out)?;
            self.out.get_mut().flush()?;
            self.emitted += 1;
        }
        Ok(())
    }

    fn emit_one(
        &mut self,
        meta: &Metadata,
        link_text: Option<&Utf8Path>,
        name: &Utf8Path,
        content_path: &Utf8Path,
    ) -> Result<()> {
        let mut entry_type = entry_type_for(meta)
            .ok_or_else(|| anyhow!("Unsupported file type for {content_path}"))?;
        if entry_type == tar::EntryType::Regular
            && self.opts.expand_archives
            && archive::is_archive(content_path)
        {
            return self.expand_archive(content_path);
        }
        // Open first; it's the likeliest thing to fail
        let mut content = None;
        if entry_type == tar::EntryType::Regular {
            match File::open(content_path) {
                Ok(f) => content = Some(f),
                Err(e) if self.opts.ignore_unreadable && is_permission_denied(&e) => {
                    tracing::debug!("Skipping unreadable {content_path}");
                    return Ok(());
                }
                Err(e) if is_not_found(&e) => {
                    tracing::warn!("{content_path} vanished while archiving it");
                    return Ok(());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Opening {content_path}"));
                }
            }
        }
        let name = apply_rename(&self.opts.rename, name);

        let mut h = tar::Header::new_gnu();
        let mut mode = meta.mode() & 0o7777;
        let mut size = if entry_type == tar::EntryType::Regular {
            meta.len()
        } else {
            0
        };
        let mut link_name = link_text.map(ToOwned::to_owned);
        if entry_type == tar::EntryType::Regular {
            if let Some(prior) = self.hardlinks.check(meta, &name) {
                entry_type = tar::EntryType::Link;
                link_name = Some(hardlink_name(&prior, &name));
                size = 0;
                content = None;
            }
        }
        if self.opts.strip_setid_bits {
            mode &= !0o7000;
        }
        let mut owner = IdPair {
            uid: meta.uid(),
            gid: meta.gid(),
        };
        if !self.idmap.is_empty() {
            owner = self
                .idmap
                .to_container(owner)
                .with_context(|| format!("Mapping owner of {content_path}"))?;
        }
        let (chown, chmod) = if entry_type == tar::EntryType::Directory {
            (self.opts.chown_dirs, self.opts.chmod_dirs)
        } else {
            (self.opts.chown_files, self.opts.chmod_files)
        };
        if let Some(chown) = chown {
            owner = chown;
        }
        if let Some(chmod) = chmod {
            mode = chmod & 0o7777;
        }

        h.set_entry_type(entry_type);
        h.set_mode(mode);
        h.set_uid(owner.uid.into());
        h.set_gid(owner.gid.into());
        h.set_size(size);
        h.set_mtime(meta.mtime().max(0) as u64);
        if let Some(gnu) = h.as_gnu_mut() {
            gnu.set_atime(meta.atime().max(0) as u64);
        }
        if matches!(entry_type, tar::EntryType::Char | tar::EntryType::Block) {
            let rdev = meta.rdev();
            h.set_device_major(rustix::fs::major(rdev))?;
            h.set_device_minor(rustix::fs::minor(rdev))?;
        }

        if !self.opts.strip_xattrs {
            let xattrs = xattrs::read_xattrs(content_path)?;
            if !xattrs.is_empty() {
                let records = xattrs_to_pax(&xattrs);
                self.out
                    .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), *v)))?;
            }
        }

        tracing::trace!("Emitting {name} ({entry_type:?})");
        match (link_name, content) {
            (Some(target), _) => self.out.append_link(&mut h, &name, &target)?,
            (None, Some(f)) => {
                let mut f = f.take(size);
                self.out.append_data(&mut h, &name, &mut f)?;
                if f.limit() != 0 {
                    anyhow::bail!("{content_path} shrank while archiving it");
                }
            }
            (None, None) => self.out.append_data(&mut h, &name, std::io::empty())?,
        }
        self.emitted += 1;
        Ok(())
    }

    fn run(&mut self, queue: &[GlobMatch]) -> Result<()> {
        for item in queue {
            self.export_item(item)?;
        }
        if self.emitted == 0 {
            anyhow::bail!("No content to archive; the archive would be empty");
        }
        self.out.finish()?;
        self.out.get_mut().flush()?;
        Ok(())
    }
}

/// Handle a normalized Get request.  The archive is written by the
/// returned [`Bulk::Get`] once the response has been delivered.
#[instrument(level = "debug", skip_all)]
pub(crate) fn handle_get(req: &Request) -> Result<(Response, Bulk)> {
    let excludes = ExcludeMatcher::new(&req.get_options.excludes)?;
    stat_globs(req, &excludes)?;

    let mut queue = Vec::new();
    for (index, glob) in req.globs.iter().enumerate() {
        let mut matched = false;
        for m in expand_glob(&req.root, glob, &excludes)? {
            let rel = req.relative_to_root(&m.path)?;
            if rel.as_str() != "." && excludes.matches(&rel) {
                continue;
            }
            matched = true;
            queue.push(m);
        }
        if !matched {
            let glob = req.preserved_globs.get(index).unwrap_or(glob);
            return Err(no_matches(glob));
        }
    }
    tracing::debug!("Archiving {} items", queue.len());

    let req = req.clone();
    let bulk = Bulk::Get(Box::new(move |w: &mut dyn Write| {
        let aborted = Rc::new(Cell::new(false));
        let out = tar::Builder::new(AbortOnError {
            inner: w,
            aborted: Rc::clone(&aborted),
        });
        let mut exporter = Exporter {
            req: &req,
            opts: &req.get_options,
            excludes: &excludes,
            idmap: req.get_idmappings(),
            hardlinks: HardlinkTracker::new(),
            out,
            emitted: 0,
        };
        let r = exporter.run(&queue);
        if r.is_err() {
            aborted.set(true);
        }
        r
    }));
    Ok((Response::default(), bulk))
}
