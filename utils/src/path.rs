use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Helper to format a path.
#[derive(Debug)]
pub struct PathQuotedDisplay<'a> {
    path: &'a Path,
}

impl<'a> Display for PathQuotedDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.path.to_str() {
            if s.chars()
                .all(|c| matches!(c, '/' | '.' | '-' | '_') || c.is_alphanumeric())
            {
                return f.write_str(s);
            }
        }
        if let Ok(r) = shlex::bytes::try_quote(self.path.as_os_str().as_bytes()) {
            if let Ok(s) = std::str::from_utf8(&r) {
                return f.write_str(s);
            }
        }
        // Should not happen really
        Err(std::fmt::Error)
    }
}

impl<'a> PathQuotedDisplay<'a> {
    /// Given a path, quote it in a way that it would be parsed by a default
    /// POSIX shell. If the path is UTF-8 with no spaces or shell meta-characters,
    /// it will be exactly the same as the input.
    pub fn new<P: AsRef<Path>>(path: &'a P) -> PathQuotedDisplay<'a> {
        PathQuotedDisplay {
            path: path.as_ref(),
        }
    }
}

/// Lexically normalize a path: `.` and empty components are dropped and
/// `..` removes the preceding component.  A `..` directly below `/` is
/// dropped; leading `..` of a relative path are kept.  The empty path
/// becomes `.`.
pub fn clean(path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
    let path = path.as_ref();
    let mut absolute = false;
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Utf8Component::Prefix(_) => {}
            Utf8Component::RootDir => absolute = true,
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            Utf8Component::Normal(name) => parts.push(name),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => Utf8PathBuf::from(format!("/{joined}")),
        (false, true) => Utf8PathBuf::from("."),
        (false, false) => Utf8PathBuf::from(joined),
    }
}

/// Clean `path` as if it were anchored at `/`, and return it relative to
/// that anchor.  The result never begins with `..` or `/`; the anchor
/// itself is `.`.
pub fn clean_relative(path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
    let anchored = clean(Utf8Path::new("/").join(path));
    match anchored.strip_prefix("/") {
        Ok(rel) if !rel.as_str().is_empty() => rel.to_owned(),
        _ => Utf8PathBuf::from("."),
    }
}

/// Express `path` relative to `root`, after cleaning both.  Fails if the
/// path is not `root` itself or something below it.
pub fn relative_subdirectory(
    root: impl AsRef<Utf8Path>,
    path: impl AsRef<Utf8Path>,
) -> anyhow::Result<Utf8PathBuf> {
    let root = clean(root);
    let path = clean(path);
    let rel = path
        .strip_prefix(&root)
        .map_err(|_| anyhow::anyhow!("{path} is not inside {root}"))?;
    if rel.as_str().is_empty() {
        Ok(Utf8PathBuf::from("."))
    } else {
        Ok(rel.to_owned())
    }
}

/// Join a relative path produced by [`clean_relative`] or
/// [`relative_subdirectory`] onto `base`, without a trailing `/.`.
pub fn join_relative(base: &Utf8Path, rel: &Utf8Path) -> Utf8PathBuf {
    if rel.as_str() == "." {
        base.to_owned()
    } else {
        base.join(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquoted() {
        for v in ["", "foo", "/var/lib/containers", "/foo/bar/../baz", "layer_9-a"] {
            assert_eq!(v, format!("{}", PathQuotedDisplay::new(&v)));
        }
    }

    #[test]
    fn test_quoted() {
        let cases = [
            (" ", "' '"),
            ("/build root/", "'/build root/'"),
            ("/ctx/*.tar", "'/ctx/*.tar'"),
        ];
        for (v, quoted) in cases {
            assert_eq!(quoted, format!("{}", PathQuotedDisplay::new(&v)));
        }
    }

    #[test]
    fn test_clean() {
        let cases = [
            ("", "."),
            (".", "."),
            ("/", "/"),
            ("/..", "/"),
            ("/a/../../b", "/b"),
            ("a/./b//c/", "a/b/c"),
            ("a/..", "."),
            ("../a", "../a"),
            ("a/../../b", "../b"),
            ("/tmp/r/x/../y", "/tmp/r/y"),
        ];
        for (input, expected) in cases {
            similar_asserts::assert_eq!(clean(input).as_str(), expected, "input: {input}");
        }
    }

    #[test]
    fn test_clean_relative() {
        let cases = [
            ("", "."),
            ("/", "."),
            ("..", "."),
            ("../../etc", "etc"),
            ("/abs/file", "abs/file"),
            ("a/../../b/./c", "b/c"),
        ];
        for (input, expected) in cases {
            similar_asserts::assert_eq!(
                clean_relative(input).as_str(),
                expected,
                "input: {input}"
            );
        }
    }

    #[test]
    fn test_relative_subdirectory() -> anyhow::Result<()> {
        let root = Utf8Path::new("/tmp/r");
        assert_eq!(relative_subdirectory(root, "/tmp/r")?, ".");
        assert_eq!(relative_subdirectory(root, "/tmp/r/a/b")?, "a/b");
        assert_eq!(relative_subdirectory(root, "/tmp/r/a/../b")?, "b");
        assert!(relative_subdirectory(root, "/tmp/rr").is_err());
        assert!(relative_subdirectory(root, "/tmp/r/../etc").is_err());
        assert_eq!(relative_subdirectory("/", "/etc")?, "etc");
        Ok(())
    }

    #[test]
    fn test_join_relative() {
        assert_eq!(join_relative(Utf8Path::new("/r"), Utf8Path::new(".")), "/r");
        assert_eq!(join_relative(Utf8Path::new("/r"), Utf8Path::new("a/b")), "/r/a/b");
    }
}
