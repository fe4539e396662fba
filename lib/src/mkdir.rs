//! Creating directories below the root, and the Mkdir handler.

use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

use anyhow::Context;
use camino::{Utf8Component, Utf8Path};
use fn_error_context::context;
use tarcopy_utils::PathQuotedDisplay;
use tracing::instrument;

use crate::idmap::IdPair;
use crate::platform::lchown;
use crate::resolve::resolve;
use crate::{Request, Response, Result};

/// Permission bits for directories created without an explicit mode.
pub(crate) const DEFAULT_DIR_MODE: u32 = 0o755;

/// Make sure `path`, which must be `root` or below it, is a directory.
/// Missing components are created in order with `owner` and `mode`;
/// components which already exist are not modified.
#[context("Creating directory {path}")]
pub(crate) fn ensure_directory(
    root: &Utf8Path,
    path: &Utf8Path,
    owner: IdPair,
    mode: u32,
) -> Result<()> {
    let rel = tarcopy_utils::relative_subdirectory(root, path)?;
    let mut cur = root.to_owned();
    for component in rel.components() {
        let Utf8Component::Normal(name) = component else {
            continue;
        };
        cur.push(name);
        match std::fs::DirBuilder::new().mode(0o700).create(&cur) {
            Ok(()) => {
                tracing::trace!("Created {cur}");
                lchown(&cur, owner.uid, owner.gid)
                    .with_context(|| format!("Setting owner of {cur}"))?;
                std::fs::set_permissions(&cur, std::fs::Permissions::from_mode(mode))
                    .with_context(|| format!("Setting mode of {cur}"))?;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Anything but a directory is a problem, even a symlink to
                // one; we expect to be given an already resolved path.
                let meta = cur.symlink_metadata()?;
                if !meta.is_dir() {
                    anyhow::bail!("{cur} exists and is not a directory");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Handle a normalized Mkdir request.
#[instrument(level = "debug", skip_all)]
pub(crate) fn handle_mkdir(req: &Request) -> Result<Response> {
    let opts = &req.mkdir_options;
    let mut owner = opts.chown_new.unwrap_or_default();
    let idmap = req.get_idmappings();
    if !idmap.is_empty() {
        owner = idmap.to_host(owner)?;
    }
    let mode = opts.chmod_new.unwrap_or(DEFAULT_DIR_MODE);
    let dir = resolve(&req.root, &req.directory, None)?;
    tracing::debug!("mkdir {}", PathQuotedDisplay::new(&dir));
    ensure_directory(&req.root, &dir, owner, mode)?;
    Ok(Response::default())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use camino::Utf8PathBuf;

    use super::*;

    fn current_ids() -> IdPair {
        IdPair {
            uid: rustix::process::geteuid().as_raw(),
            gid: rustix::process::getegid().as_raw(),
        }
    }

    #[test]
    fn test_ensure_directory() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        std::fs::create_dir(root.join("a"))?;
        std::fs::set_permissions(root.join("a"), std::fs::Permissions::from_mode(0o700))?;
        let target = root.join("a/b/c");
        ensure_directory(&root, &target, current_ids(), 0o750)?;
        // Idempotent
        ensure_directory(&root, &target, current_ids(), 0o750)?;
        assert!(target.is_dir());
        assert_eq!(root.join("a/b").symlink_metadata()?.mode() & 0o7777, 0o750);
        // Existing components are untouched
        assert_eq!(root.join("a").symlink_metadata()?.mode() & 0o7777, 0o700);

        std::fs::write(root.join("file"), "")?;
        assert!(ensure_directory(&root, &root.join("file/x"), current_ids(), 0o755).is_err());
        assert!(ensure_directory(&root, Utf8Path::new("/elsewhere"), current_ids(), 0o755).is_err());
        Ok(())
    }

    #[test]
    fn test_mkdir() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        std::fs::create_dir(root.join("real"))?;
        std::os::unix::fs::symlink("/real", root.join("link"))?;
        let mut req = Request::new(crate::RequestKind::Mkdir, &root, root.join("link/new"));
        req.mkdir_options.chown_new = Some(current_ids());
        req.normalize(None)?;
        handle_mkdir(&req)?;
        assert!(root.join("real/new").is_dir());
        Ok(())
    }
}
