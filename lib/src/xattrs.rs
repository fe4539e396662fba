//! Extended attributes, read and written without following symlinks.

use std::io::ErrorKind;

use anyhow::Context;
use camino::Utf8Path;
use rustix::io::Errno;

use crate::Result;

/// Prefix of PAX records carrying extended attributes.
// https://mgorny.pl/articles/portability-of-tar-features.html#id25
pub(crate) const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

/// Only these attributes are copied; in particular SELinux labels from
/// the source must not follow content into an image.
const RELEVANT_XATTRS: &[&str] = &["security.capability", "security.ima", "user."];

/// An extended attribute name and value.
pub(crate) type Xattr = (String, Vec<u8>);

fn is_relevant(name: &str) -> bool {
    RELEVANT_XATTRS.iter().any(|p| name.starts_with(p))
}

fn is_unsupported(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::Unsupported
        || matches!(
            Errno::from_io_error(e),
            Some(Errno::NOTSUP) | Some(Errno::NOSYS)
        )
}

/// Read the relevant extended attributes of `path`.  A filesystem without
/// xattr support has none.
pub(crate) fn read_xattrs(path: &Utf8Path) -> Result<Vec<Xattr>> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if is_unsupported(&e) => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Listing xattrs of {path}")),
    };
    let mut r = Vec::new();
    for name in names {
        let Some(name) = name.to_str() else {
            tracing::debug!("Skipping non-UTF-8 xattr on {path}: {name:?}");
            continue;
        };
        if !is_relevant(name) {
            continue;
        }
        let value = xattr::get(path, name)
            .with_context(|| format!("Reading xattr {name} of {path}"))?;
        // It may have been removed since we listed it
        if let Some(value) = value {
            r.push((name.to_owned(), value));
        }
    }
    r.sort();
    Ok(r)
}

/// Set extended attributes on `path`; irrelevant names are skipped.
pub(crate) fn write_xattrs(path: &Utf8Path, xattrs: &[Xattr]) -> Result<()> {
    for (name, value) in xattrs.iter().filter(|(n, _)| is_relevant(n)) {
        xattr::set(path, name, value).with_context(|| format!("Setting xattr {name} on {path}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn test_relevant() {
        assert!(is_relevant("user.foo"));
        assert!(is_relevant("security.capability"));
        assert!(!is_relevant("security.selinux"));
        assert!(!is_relevant("trusted.overlay.opaque"));
    }

    #[test]
    fn test_roundtrip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("f"))?;
        std::fs::write(&path, "x")?;
        // tmpfs only grew user xattrs in Linux 6.6
        if let Err(e) = xattr::set(&path, "user.marker", b"1") {
            eprintln!("skipping, no user xattrs: {e}");
            return Ok(());
        }
        xattr::remove(&path, "user.marker")?;
        assert!(read_xattrs(&path)?.is_empty());
        let attrs = vec![
            ("user.a".to_string(), b"1".to_vec()),
            ("user.b".to_string(), Vec::new()),
            ("security.selinux".to_string(), b"ignored".to_vec()),
        ];
        write_xattrs(&path, &attrs)?;
        similar_asserts::assert_eq!(read_xattrs(&path)?, attrs[..2].to_vec());
        Ok(())
    }
}
