//! # Tar streams from and to directory trees
//!
//! The Get handler ([`export`]) serializes files into a tar stream, and the
//! Put handler ([`import`]) materializes a stream into a directory.
//!
//! # Format
//!
//! Streams use GNU headers, with PAX extended headers where needed.  Only
//! numeric owners are written; user and group names are not portable
//! between a build host and the image being built.
//!
//! # Extended attributes
//!
//! Extended attributes are carried in `SCHILY.xattr.<name>` PAX records, as
//! GNU tar and most container tooling do.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::xattrs::{Xattr, PAX_SCHILY_XATTR};
use crate::Result;

mod export;
pub(crate) use export::*;
mod import;
pub(crate) use import::*;

/// Copy a tar entry to a new tar archive.
#[context("Copying entry")]
pub(crate) fn copy_entry(
    mut entry: tar::Entry<impl Read>,
    dest: &mut tar::Builder<impl Write>,
) -> Result<()> {
    // Make copies of both the header and path, since that's required for the append APIs
    let path = (*entry.path()?).to_owned();
    let mut header = entry.header().clone();
    if let Some(headers) = entry.pax_extensions()? {
        let extensions = headers
            .map(|ext| {
                let ext = ext?;
                Ok((ext.key()?, ext.value_bytes()))
            })
            .collect::<Result<Vec<_>>>()?;
        dest.append_pax_extensions(extensions.as_slice().iter().copied())?;
    }

    // Need to use the entry.link_name() not the header.link_name()
    // api as the header api does not handle long paths:
    // https://github.com/alexcrichton/tar-rs/issues/192
    match entry.header().entry_type() {
        tar::EntryType::Symlink | tar::EntryType::Link => {
            let target = entry.link_name()?.ok_or_else(|| anyhow!("Invalid link"))?;
            let target = target.into_owned();
            dest.append_link(&mut header, path, target)
        }
        _ => dest.append_data(&mut header, path, entry),
    }
    .map_err(Into::into)
}

/// Rewrite `name` through `rename`: an exact match wins, then the longest
/// leading directory which has a mapping.
pub(crate) fn apply_rename(rename: &BTreeMap<String, String>, name: &Utf8Path) -> Utf8PathBuf {
    if rename.is_empty() {
        return name.to_owned();
    }
    if let Some(renamed) = rename.get(name.as_str()) {
        return Utf8PathBuf::from(renamed);
    }
    for ancestor in name.ancestors().skip(1) {
        if ancestor.as_str().is_empty() {
            break;
        }
        if let Some(renamed) = rename.get(ancestor.as_str()) {
            let rest = name.strip_prefix(ancestor).unwrap_or(name);
            return Utf8Path::new(renamed).join(rest);
        }
    }
    name.to_owned()
}

/// Encode extended attributes as PAX records.
pub(crate) fn xattrs_to_pax(xattrs: &[Xattr]) -> Vec<(String, &[u8])> {
    xattrs
        .iter()
        .map(|(k, v)| (format!("{PAX_SCHILY_XATTR}{k}"), v.as_slice()))
        .collect()
}

/// Extended attributes and times from an entry's PAX records.
#[derive(Debug, Default)]
pub(crate) struct PaxMetadata {
    pub(crate) xattrs: Vec<Xattr>,
    pub(crate) atime: Option<i64>,
    pub(crate) mtime: Option<i64>,
}

/// PAX times are decimal seconds, possibly with a fraction which we drop.
fn parse_pax_time(v: &[u8]) -> Option<i64> {
    let v = std::str::from_utf8(v).ok()?;
    let secs = v.split_once('.').map(|(s, _)| s).unwrap_or(v);
    secs.parse().ok()
}

pub(crate) fn pax_metadata(entry: &mut tar::Entry<impl Read>) -> Result<PaxMetadata> {
    let mut r = PaxMetadata::default();
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(r);
    };
    for ext in extensions {
        let ext = ext?;
        let key = ext.key()?;
        if let Some(name) = key.strip_prefix(PAX_SCHILY_XATTR) {
            r.xattrs.push((name.to_owned(), ext.value_bytes().to_owned()));
        } else if key == "atime" {
            r.atime = parse_pax_time(ext.value_bytes());
        } else if key == "mtime" {
            r.mtime = parse_pax_time(ext.value_bytes());
        }
    }
    Ok(r)
}
