//! Thin wrappers for the special-file and metadata syscalls extraction needs.

use camino::Utf8Path;
use rustix::fs::{AtFlags, Timespec, Timestamps, CWD};

/// The kinds of node [`mknod`] creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpecialFile {
    CharDevice,
    BlockDevice,
    Fifo,
}

/// Create a device node or FIFO.
#[cfg(target_os = "linux")]
pub(crate) fn mknod(
    path: &Utf8Path,
    kind: SpecialFile,
    mode: u32,
    major: u32,
    minor: u32,
) -> std::io::Result<()> {
    use rustix::fs::{FileType, Mode};
    let file_type = match kind {
        SpecialFile::CharDevice => FileType::CharacterDevice,
        SpecialFile::BlockDevice => FileType::BlockDevice,
        SpecialFile::Fifo => FileType::Fifo,
    };
    let dev = rustix::fs::makedev(major, minor);
    rustix::fs::mknodat(
        CWD,
        path.as_std_path(),
        file_type,
        Mode::from_bits_truncate(mode),
        dev,
    )?;
    Ok(())
}

/// Device nodes are only supported on Linux.
#[cfg(not(target_os = "linux"))]
pub(crate) fn mknod(
    _path: &Utf8Path,
    _kind: SpecialFile,
    _mode: u32,
    _major: u32,
    _minor: u32,
) -> std::io::Result<()> {
    Err(rustix::io::Errno::NOSYS.into())
}

/// Set access and modification times (in seconds) of `path`, which may
/// be a symlink.
pub(crate) fn set_times(path: &Utf8Path, atime: i64, mtime: i64) -> std::io::Result<()> {
    let times = Timestamps {
        last_access: Timespec {
            tv_sec: atime,
            tv_nsec: 0,
        },
        last_modification: Timespec {
            tv_sec: mtime,
            tv_nsec: 0,
        },
    };
    rustix::fs::utimensat(
        CWD,
        path.as_std_path(),
        &times,
        AtFlags::SYMLINK_NOFOLLOW,
    )?;
    Ok(())
}

/// Change ownership of `path` without following a final symlink.
pub(crate) fn lchown(path: &Utf8Path, uid: u32, gid: u32) -> std::io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
}
