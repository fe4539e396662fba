//! Integration tests for copying between trees and tar streams in
//! process.

use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tarcopy_lib::idmap::IdPair;
use tarcopy_lib::resolve::resolve;
use tarcopy_lib::{Copier, GetOptions, Isolation, PutOptions, StatOptions};

fn copier() -> Copier {
    Copier::new().with_isolation(Isolation::InProcess)
}

fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let td = tempfile::tempdir()?;
    let path = Utf8PathBuf::try_from(td.path().to_path_buf())?;
    Ok((td, path))
}

fn current_ids() -> IdPair {
    IdPair {
        uid: rustix::process::geteuid().as_raw(),
        gid: rustix::process::getegid().as_raw(),
    }
}

/// Directories created implicitly default to root ownership, which we
/// can't set when unprivileged.
fn put_options() -> PutOptions {
    PutOptions {
        chown_dirs: Some(current_ids()),
        ..Default::default()
    }
}

fn header(entry_type: tar::EntryType, mode: u32, size: u64, mtime: u64) -> tar::Header {
    let ids = current_ids();
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(entry_type);
    h.set_mode(mode);
    h.set_size(size);
    h.set_mtime(mtime);
    h.set_uid(ids.uid.into());
    h.set_gid(ids.gid.into());
    h
}

/// Name, type, link name and size of each entry.
fn list(data: &[u8]) -> Result<Vec<(String, tar::EntryType, Option<String>, u64)>> {
    let mut a = tar::Archive::new(data);
    let mut r = Vec::new();
    for e in a.entries()? {
        let e = e?;
        let link = e.link_name()?.map(|l| l.to_string_lossy().into_owned());
        r.push((
            e.path()?.to_string_lossy().into_owned(),
            e.header().entry_type(),
            link,
            e.header().size()?,
        ));
    }
    Ok(r)
}

async fn get(root: &Utf8Path, options: &GetOptions, globs: &[&str]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    copier().get(root, ".", options, globs, &mut out).await?;
    Ok(out)
}

#[tokio::test]
async fn symlinks_stay_in_root() -> Result<()> {
    let (_td, root) = tempdir()?;
    std::os::unix::fs::symlink("/etc", root.join("a"))?;
    std::os::unix::fs::symlink("../../etc", root.join("b"))?;

    let r = copier()
        .stat(&root, ".", &StatOptions::default(), &["a", "b"])
        .await?;
    let a = &r[0].results["a"];
    assert!(a.is_symlink);
    assert_eq!(a.immediate_target.as_deref(), Some("/etc"));
    // Nothing named etc exists in the root
    assert!(!a.is_dir);

    for link in ["a", "b"] {
        let resolved = resolve(&root, &root.join(link).join("passwd"), None)?;
        assert_eq!(resolved, root.join("etc/passwd"));
    }
    std::fs::create_dir(root.join("etc"))?;
    assert_eq!(copier().eval(&root, "b").await?, root.join("etc"));
    let r = copier()
        .stat(&root, ".", &StatOptions::default(), &["b"])
        .await?;
    assert!(r[0].results["b"].is_dir);
    Ok(())
}

#[tokio::test]
async fn symlinked_parents_stay_in_root() -> Result<()> {
    let (_td, root) = tempdir()?;
    std::os::unix::fs::symlink("/etc", root.join("a"))?;

    // The host's /etc/passwd must not be found through the link
    let r = copier()
        .stat(&root, ".", &StatOptions::default(), &["a/passwd", "a/pass*"])
        .await?;
    assert!(r[0].error.is_some());
    assert!(r[1].error.is_some());
    assert!(get(&root, &GetOptions::default(), &["a/passwd"]).await.is_err());
    assert!(get(&root, &GetOptions::default(), &["a/pass*"]).await.is_err());

    std::fs::create_dir(root.join("etc"))?;
    std::fs::write(root.join("etc/passwd"), "root:x:0:0::/root:/bin/sh\n")?;
    let r = copier()
        .stat(&root, ".", &StatOptions::default(), &["a/pass*"])
        .await?;
    assert_eq!(r[0].globbed, ["a/passwd"]);
    assert_eq!(r[0].results["a/passwd"].size, 26);
    let data = get(&root, &GetOptions::default(), &["a/pass*"]).await?;
    let entries = list(&data)?;
    similar_asserts::assert_eq!(
        entries,
        [("passwd".to_string(), tar::EntryType::Regular, None, 26)]
    );
    Ok(())
}

#[tokio::test]
async fn exclusions_with_reinclude() -> Result<()> {
    let (_td, root) = tempdir()?;
    for f in ["file-a", "file-b", "file-c"] {
        std::fs::write(root.join(f), f)?;
    }
    std::fs::create_dir(root.join("subdir-a"))?;
    std::fs::write(root.join("subdir-a/file-c"), "")?;

    let options = GetOptions {
        excludes: vec!["**/*-a".into(), "!**/*-c".into()],
        ..Default::default()
    };
    let data = get(&root, &options, &["."]).await?;
    let names = list(&data)?
        .into_iter()
        .map(|(name, ..)| name)
        .collect::<Vec<_>>();
    similar_asserts::assert_eq!(names, ["file-b", "file-c", "subdir-a/file-c"]);
    Ok(())
}

#[tokio::test]
async fn setuid_survives_put() -> Result<()> {
    let (_td, root) = tempdir()?;
    let mut b = tar::Builder::new(Vec::new());
    b.append_data(
        &mut header(tar::EntryType::Regular, 0o4755, 4, 1000),
        "bin/tool",
        &b"\x7fELF"[..],
    )?;
    let data = b.into_inner()?;
    copier()
        .put(&root, ".", &put_options(), data.as_slice())
        .await?;
    let meta = root.join("bin/tool").symlink_metadata()?;
    assert_eq!(meta.permissions().mode() & 0o7777, 0o4755);
    Ok(())
}

#[tokio::test]
async fn hardlinks_are_collapsed() -> Result<()> {
    let (_td, root) = tempdir()?;
    std::fs::write(root.join("x"), "shared")?;
    std::fs::hard_link(root.join("x"), root.join("y"))?;
    let data = get(&root, &GetOptions::default(), &["."]).await?;
    similar_asserts::assert_eq!(
        list(&data)?,
        [
            ("x".to_string(), tar::EntryType::Regular, None, 6),
            ("y".to_string(), tar::EntryType::Link, Some("x".to_string()), 0),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn directory_mtime_is_restored() -> Result<()> {
    let (_td, root) = tempdir()?;
    let mut b = tar::Builder::new(Vec::new());
    b.append_data(
        &mut header(tar::EntryType::Directory, 0o755, 0, 1000),
        "d/",
        std::io::empty(),
    )?;
    b.append_data(
        &mut header(tar::EntryType::Regular, 0o644, 2, 2000),
        "d/f",
        &b"hi"[..],
    )?;
    let data = b.into_inner()?;
    copier()
        .put(&root, ".", &put_options(), data.as_slice())
        .await?;
    assert_eq!(root.join("d").symlink_metadata()?.mtime(), 1000);
    assert_eq!(root.join("d/f").symlink_metadata()?.mtime(), 2000);
    Ok(())
}

#[tokio::test]
async fn get_then_put_reproduces_tree() -> Result<()> {
    let (_td, base) = tempdir()?;
    let src = base.join("src");
    let dest = base.join("dest");
    std::fs::create_dir_all(src.join("usr/share/doc"))?;
    std::fs::write(src.join("usr/share/doc/README"), "read me")?;
    std::fs::write(src.join("usr/run"), "#!/bin/sh\n")?;
    std::fs::set_permissions(src.join("usr/run"), std::fs::Permissions::from_mode(0o750))?;
    std::os::unix::fs::symlink("share/doc", src.join("usr/docs"))?;
    std::fs::hard_link(src.join("usr/run"), src.join("usr/run2"))?;

    let data = get(&src, &GetOptions::default(), &["usr"]).await?;
    let rename: BTreeMap<String, String> = [("share".to_string(), "lib".to_string())].into();
    let options = PutOptions {
        rename,
        ..put_options()
    };
    copier()
        .put(&dest, "opt", &options, data.as_slice())
        .await?;

    let opt = dest.join("opt");
    assert_eq!(std::fs::read_to_string(opt.join("lib/doc/README"))?, "read me");
    assert_eq!(opt.join("docs").read_link_utf8()?, "share/doc");
    let run = opt.join("run").symlink_metadata()?;
    let run2 = opt.join("run2").symlink_metadata()?;
    assert_eq!(run.permissions().mode() & 0o7777, 0o750);
    assert_eq!(run.ino(), run2.ino());

    // The same content comes back out, modulo the rename
    let again = get(&dest, &GetOptions::default(), &["opt"]).await?;
    let names = |data: &[u8]| -> Result<Vec<String>> {
        Ok(list(data)?.into_iter().map(|(name, ..)| name).collect())
    };
    let expected = names(&data)?
        .into_iter()
        .map(|n| n.replacen("share", "lib", 1))
        .collect::<std::collections::BTreeSet<_>>();
    let found = names(&again)?.into_iter().collect();
    similar_asserts::assert_eq!(expected, found);
    Ok(())
}

#[tokio::test]
async fn errors_are_reported() -> Result<()> {
    let (_td, root) = tempdir()?;
    let r = get(&root, &GetOptions::default(), &["missing"]).await;
    let msg = format!("{:#}", r.err().ok_or_else(|| anyhow!("expected an error"))?);
    assert!(msg.contains("no items matching glob \"missing\""), "{msg}");

    let r = copier()
        .stat(&root, "/elsewhere", &StatOptions::default(), &["*"])
        .await;
    assert!(r.is_err());

    let r = copier()
        .put(&root, ".", &PutOptions::default(), &b"not a tar archive"[..])
        .await;
    assert!(r.is_err());
    Ok(())
}
