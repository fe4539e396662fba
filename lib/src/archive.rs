//! Best-effort detection of (possibly compressed) tar archives.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use camino::Utf8Path;

use crate::Result;

/// Compression envelopes we can see through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Not compressed
    None,
    /// gzip
    Gzip,
    /// bzip2
    Bzip2,
    /// xz
    Xz,
    /// zstd
    Zstd,
}

impl Compression {
    /// Identify the compression from the leading bytes of a stream.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if magic.starts_with(b"BZh") {
            Self::Bzip2
        } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Self::Xz
        } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }
}

/// Sniff the compression of `src` and wrap it in the matching decoder.
pub fn decompressor<'a>(mut src: impl BufRead + 'a) -> Result<Box<dyn Read + 'a>> {
    let compression = Compression::detect(src.fill_buf()?);
    tracing::trace!("Detected compression: {compression:?}");
    let r: Box<dyn Read + 'a> = match compression {
        Compression::None => Box::new(src),
        Compression::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(src)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(src)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(src)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(src)?),
    };
    Ok(r)
}

/// Open `path` as an archive, decompressing if needed.
pub(crate) fn open_archive(path: &Utf8Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let f = File::open(path)?;
    Ok(tar::Archive::new(decompressor(BufReader::new(f))?))
}

/// Whether `path` looks like a tar archive: after decompression, the first
/// header must parse.  Any failure along the way just means "no".
pub fn is_archive(path: &Utf8Path) -> bool {
    let first_entry_ok = || -> Result<bool> {
        let mut archive = open_archive(path)?;
        let mut entries = archive.entries()?;
        Ok(matches!(entries.next(), Some(Ok(_))))
    };
    match first_entry_ok() {
        Ok(v) => v,
        Err(e) => {
            tracing::trace!("{path} is not an archive: {e:#}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use camino::Utf8PathBuf;

    use super::*;

    fn small_tar() -> Result<Vec<u8>> {
        let mut b = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_gnu();
        h.set_size(5);
        h.set_mode(0o644);
        h.set_entry_type(tar::EntryType::Regular);
        b.append_data(&mut h, "hello.txt", &b"hello"[..])?;
        Ok(b.into_inner()?)
    }

    #[test]
    fn test_detect() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 8]), Compression::Gzip);
        assert_eq!(Compression::detect(b"BZh91AY"), Compression::Bzip2);
        assert_eq!(
            Compression::detect(&[0xfd, b'7', b'z', b'X', b'Z', 0]),
            Compression::Xz
        );
        assert_eq!(
            Compression::detect(&[0x28, 0xb5, 0x2f, 0xfd, 0]),
            Compression::Zstd
        );
        assert_eq!(Compression::detect(b"hello"), Compression::None);
        assert_eq!(Compression::detect(&[]), Compression::None);
    }

    #[test]
    fn test_is_archive() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let tar = small_tar()?;

        let gz = {
            let mut e = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            e.write_all(&tar)?;
            e.finish()?
        };
        let bz = {
            let mut e = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
            e.write_all(&tar)?;
            e.finish()?
        };
        let xz = {
            let mut e = xz2::write::XzEncoder::new(Vec::new(), 1);
            e.write_all(&tar)?;
            e.finish()?
        };
        let zst = zstd::stream::encode_all(tar.as_slice(), 0)?;

        for (name, data, expected) in [
            ("plain.tar", tar.as_slice(), true),
            ("a.tar.gz", gz.as_slice(), true),
            ("a.tar.bz2", bz.as_slice(), true),
            ("a.tar.xz", xz.as_slice(), true),
            ("a.tar.zst", zst.as_slice(), true),
            ("text", b"just some text\n".as_slice(), false),
            ("empty", b"".as_slice(), false),
            ("zeros", [0u8; 1024].as_slice(), false),
            ("truncated.gz", &gz[..4], false),
        ] {
            let path = dir.join(name);
            std::fs::write(&path, data)?;
            assert_eq!(is_archive(&path), expected, "{name}");
        }
        assert!(!is_archive(&dir.join("nonexistent")));
        Ok(())
    }

    #[test]
    fn test_open_archive() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("a.tar.zst"))?;
        std::fs::write(&path, zstd::stream::encode_all(small_tar()?.as_slice(), 0)?)?;
        let mut a = open_archive(&path)?;
        let mut names = Vec::new();
        for e in a.entries()? {
            let mut e = e?;
            let mut buf = String::new();
            e.read_to_string(&mut buf)?;
            names.push((e.path()?.to_string_lossy().into_owned(), buf));
        }
        assert_eq!(names, [("hello.txt".to_string(), "hello".to_string())]);
        Ok(())
    }
}
