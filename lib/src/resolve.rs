//! Symlink resolution confined to a virtual root.
//!
//! When we can't actually `chroot()`, paths are walked one component at a
//! time and every symlink is interpreted the way the kernel would after a
//! chroot: absolute targets restart at the root, and `..` at the root is a
//! no-op.  The result is always `root` or something below it.
//!
//! None of this is safe against another process changing the tree while
//! we walk it.

use std::collections::VecDeque;

use anyhow::Context;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tarcopy_utils::{join_relative, relative_subdirectory};

use crate::exclude::ExcludeMatcher;
use crate::Result;

/// Maximum number of symlinks followed while resolving a single path.
pub const MAX_SYMLINK_FOLLOWS: usize = 64;

/// Resolve `path`, which must be `root` or below it, following symlinks
/// (including one in the final component) as if `root` were `/`.
///
/// Once a component matches `excludes`, symlinks are no longer followed
/// for the rest of the walk.  Components which don't exist are appended
/// as-is, so the result need not exist.
pub fn resolve(
    root: &Utf8Path,
    path: &Utf8Path,
    excludes: Option<&ExcludeMatcher>,
) -> Result<Utf8PathBuf> {
    resolve_impl(root, path, excludes, true, MAX_SYMLINK_FOLLOWS)
}

/// Like [`resolve`], but fail with `ELOOP` after `max_follows` symlinks.
pub(crate) fn resolve_with_limit(
    root: &Utf8Path,
    path: &Utf8Path,
    excludes: Option<&ExcludeMatcher>,
    max_follows: usize,
) -> Result<Utf8PathBuf> {
    resolve_impl(root, path, excludes, true, max_follows)
}

/// Like [`resolve`], but a symlink in the final component is returned
/// as-is rather than followed.
pub fn resolve_parents(
    root: &Utf8Path,
    path: &Utf8Path,
    excludes: Option<&ExcludeMatcher>,
) -> Result<Utf8PathBuf> {
    resolve_impl(root, path, excludes, false, MAX_SYMLINK_FOLLOWS)
}

fn push_front_components(pending: &mut VecDeque<String>, path: &Utf8Path) {
    for component in path.components().rev() {
        match component {
            Utf8Component::Normal(name) => pending.push_front(name.to_owned()),
            Utf8Component::ParentDir => pending.push_front("..".to_owned()),
            _ => {}
        }
    }
}

fn resolve_impl(
    root: &Utf8Path,
    path: &Utf8Path,
    excludes: Option<&ExcludeMatcher>,
    follow_final: bool,
    max_follows: usize,
) -> Result<Utf8PathBuf> {
    // Keep any `..` in the remainder; it has to be interpreted after the
    // symlinks before it.
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel.to_owned(),
        Err(_) => relative_subdirectory(root, path)
            .with_context(|| format!("Resolving {path} within {root}"))?,
    };
    let mut pending = VecDeque::new();
    push_front_components(&mut pending, &rel);

    let mut working: Vec<String> = Vec::new();
    let mut follows = 0;
    let mut excluded = false;
    while let Some(component) = pending.pop_front() {
        if component == ".." {
            // At the root this is a no-op
            working.pop();
            continue;
        }
        let mut candidate_rel = working.join("/");
        if !candidate_rel.is_empty() {
            candidate_rel.push('/');
        }
        candidate_rel.push_str(&component);
        if !excluded {
            if let Some(excludes) = excludes {
                excluded = excludes.matches(Utf8Path::new(&candidate_rel));
            }
        }
        let is_final = pending.is_empty();
        if !excluded && (follow_final || !is_final) {
            let candidate = root.join(&candidate_rel);
            // Anything that isn't a readable symlink is taken literally.
            if let Ok(target) = candidate.read_link_utf8() {
                follows += 1;
                if follows > max_follows {
                    return Err(std::io::Error::from(rustix::io::Errno::LOOP))
                        .with_context(|| format!("Resolving {path}"));
                }
                tracing::trace!("{candidate} -> {target}");
                if target.is_absolute() {
                    working.clear();
                }
                push_front_components(&mut pending, &target);
                continue;
            }
        }
        working.push(component);
    }
    if working.is_empty() {
        return Ok(root.to_owned());
    }
    Ok(join_relative(root, Utf8Path::new(&working.join("/"))))
}
