//! The Stat handler, and glob expansion shared with Get.

use std::collections::HashSet;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use anyhow::Context;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::DateTime;
use glob::Pattern;
use rustix::io::Errno;
use tracing::instrument;

use crate::exclude::{ExcludeMatcher, MATCH_OPTIONS};
use crate::{archive, resolve, Request, Response, StatForItem, StatsForGlob};
use crate::Result;

fn has_wildcards(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// An ENOENT error for a glob which matched nothing.
pub(crate) fn no_matches(glob: &str) -> anyhow::Error {
    anyhow::Error::new(std::io::Error::from(Errno::NOENT))
        .context(format!("no items matching glob {glob:?}"))
}

/// One match of a glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GlobMatch {
    /// The match as named through the glob, which is what gets reported.
    pub(crate) path: Utf8PathBuf,
    /// The same file, with symlinks in its parent directories resolved
    /// within the root.  A symlink in the final component is kept.
    pub(crate) real: Utf8PathBuf,
}

fn under_root(root: &Utf8Path, rel: &Utf8Path) -> Utf8PathBuf {
    if rel.as_str().is_empty() {
        root.to_owned()
    } else {
        root.join(rel)
    }
}

fn is_missing(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound || Errno::from_io_error(e) == Some(Errno::NOTDIR)
}

/// The entries of the directory `rel` names whose names match `pattern`,
/// sorted.  Anything which isn't a readable directory has none.
fn matching_children(
    root: &Utf8Path,
    rel: &Utf8Path,
    pattern: &Pattern,
    excludes: &ExcludeMatcher,
) -> Result<Vec<Utf8PathBuf>> {
    let dir = resolve::resolve(root, &under_root(root, rel), Some(excludes))?;
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::trace!("Not expanding below {dir}: {e}");
            return Ok(Vec::new());
        }
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Reading {dir}"))?;
        if pattern.matches_with(entry.file_name(), MATCH_OPTIONS) {
            names.push(entry.file_name().to_owned());
        }
    }
    names.sort();
    Ok(names.into_iter().map(|n| rel.join(n)).collect())
}

/// `rel` and everything below it, for `**`.  Symlinks are listed but
/// not descended into.
fn descendants(root: &Utf8Path, rel: &Utf8Path, excludes: &ExcludeMatcher) -> Result<Vec<Utf8PathBuf>> {
    let dir = resolve::resolve(root, &under_root(root, rel), Some(excludes))?;
    let mut r = vec![rel.to_owned()];
    if !dir.is_dir() {
        return Ok(r);
    }
    let walker = walkdir::WalkDir::new(&dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("Skipping glob entry: {e}");
                continue;
            }
        };
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| anyhow::anyhow!("Non-UTF-8 path {:?}", entry.path()))?;
        r.push(rel.join(path.strip_prefix(&dir)?));
    }
    Ok(r)
}

/// Expand `glob`, an absolute pattern inside `root`, to the existing paths
/// it matches.  Every directory is read through [`resolve::resolve`], so
/// symlinks along the way stay inside the root; metacharacters in `root`
/// itself are taken literally.
pub(crate) fn expand_glob(
    root: &Utf8Path,
    glob: &str,
    excludes: &ExcludeMatcher,
) -> Result<Vec<GlobMatch>> {
    let rel = tarcopy_utils::relative_subdirectory(root, glob)?;
    if has_wildcards(rel.as_str()) {
        // Validate the whole pattern so the error names it
        Pattern::new(rel.as_str()).with_context(|| format!("Invalid glob {glob:?}"))?;
    }
    let mut candidates = vec![Utf8PathBuf::new()];
    for component in rel.components() {
        let Utf8Component::Normal(component) = component else {
            continue;
        };
        let mut next = Vec::new();
        for candidate in &candidates {
            if component == "**" {
                next.extend(descendants(root, candidate, excludes)?);
            } else if has_wildcards(component) {
                let pattern = Pattern::new(component)
                    .with_context(|| format!("Invalid glob {glob:?}"))?;
                next.extend(matching_children(root, candidate, &pattern, excludes)?);
            } else {
                next.push(candidate.join(component));
            }
        }
        candidates = next;
    }

    let mut seen = HashSet::new();
    let mut r = Vec::new();
    for candidate in candidates {
        if !seen.insert(candidate.clone()) {
            continue;
        }
        let path = under_root(root, &candidate);
        let real = resolve::resolve_parents(root, &path, Some(excludes))?;
        match real.symlink_metadata() {
            Ok(_) => r.push(GlobMatch { path, real }),
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(e).with_context(|| format!("Examining {path}")),
        }
    }
    Ok(r)
}

fn mod_time(meta: &Metadata) -> Option<DateTime<chrono::Utc>> {
    DateTime::from_timestamp(meta.mtime(), u32::try_from(meta.mtime_nsec()).ok()?)
}

fn fill_from(item: &mut StatForItem, meta: &Metadata) {
    item.size = meta.len();
    item.mode = meta.mode();
    item.mod_time = mod_time(meta);
    item.is_dir = meta.is_dir();
    item.is_regular = meta.file_type().is_file();
}

/// Examine one match; failures are recorded on the item.
fn stat_one(
    req: &Request,
    excludes: &ExcludeMatcher,
    name: String,
    path: &Utf8Path,
) -> StatForItem {
    let mut item = StatForItem {
        name,
        ..Default::default()
    };
    if let Err(e) = stat_one_impl(req, excludes, &mut item, path) {
        item.error = Some(format!("{e:#}"));
    }
    item
}

fn stat_one_impl(
    req: &Request,
    excludes: &ExcludeMatcher,
    item: &mut StatForItem,
    path: &Utf8Path,
) -> Result<()> {
    let check_for_archives = req.stat_options.check_for_archives;
    let meta = path
        .symlink_metadata()
        .with_context(|| format!("Examining {path}"))?;
    fill_from(item, &meta);
    let mut archive_checked = false;
    if meta.file_type().is_symlink() {
        item.is_symlink = true;
        let target = path
            .read_link_utf8()
            .with_context(|| format!("Reading link {path}"))?;
        item.immediate_target = Some(target.into_string());
        let resolved = resolve::resolve(&req.root, path, Some(excludes))?;
        let target_meta = resolved
            .symlink_metadata()
            .with_context(|| format!("Examining {resolved}"))?;
        if target_meta.file_type().is_file() && check_for_archives {
            item.is_archive = archive::is_archive(&resolved);
            archive_checked = true;
        }
        fill_from(item, &target_meta);
    }
    if item.is_regular && check_for_archives && !archive_checked {
        item.is_archive = archive::is_archive(path);
    }
    Ok(())
}

fn stat_glob(
    req: &Request,
    excludes: &ExcludeMatcher,
    index: usize,
    glob: &str,
) -> Result<StatsForGlob> {
    let mut r = StatsForGlob {
        glob: req
            .preserved_globs
            .get(index)
            .cloned()
            .unwrap_or_else(|| glob.to_owned()),
        ..Default::default()
    };
    for m in expand_glob(&req.root, glob, excludes)? {
        let rel = req.relative_to_root(&m.path)?;
        if excludes.matches(&rel) {
            tracing::trace!("Excluded: {rel}");
            continue;
        }
        let name = req.reported_name(index, &m.path);
        let item = stat_one(req, excludes, name.clone(), &m.real);
        r.globbed.push(name.clone());
        r.results.insert(name, item);
    }
    if r.globbed.is_empty() {
        return Err(no_matches(&r.glob));
    }
    Ok(r)
}

/// Handle a normalized Stat request.  Only a bad request fails as a
/// whole; problems with single globs or items are reported on them.
#[instrument(level = "debug", skip_all)]
pub(crate) fn handle_stat(req: &Request) -> Result<Response> {
    let excludes = ExcludeMatcher::new(&req.stat_options.excludes)?;
    let stat = stat_globs(req, &excludes)?;
    Ok(Response {
        stat,
        ..Default::default()
    })
}

/// Stat every glob of `req`, filtering matches through `excludes`.
pub(crate) fn stat_globs(req: &Request, excludes: &ExcludeMatcher) -> Result<Vec<StatsForGlob>> {
    if req.globs.is_empty() {
        anyhow::bail!("No glob patterns provided");
    }
    let mut stat = Vec::with_capacity(req.globs.len());
    for (index, glob) in req.globs.iter().enumerate() {
        tracing::debug!("Stat {glob}");
        let result = stat_glob(req, excludes, index, glob).unwrap_or_else(|e| StatsForGlob {
            glob: req
                .preserved_globs
                .get(index)
                .cloned()
                .unwrap_or_else(|| glob.clone()),
            error: Some(format!("{e:#}")),
            ..Default::default()
        });
        stat.push(result);
    }
    Ok(stat)
}
