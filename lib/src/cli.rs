//! # Command line front end
//!
//! Each subcommand runs one operation against a root directory; tar
//! streams are written to stdout and read from stdin unless a file is
//! given.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use tokio::io::AsyncWriteExt;

use crate::idmap::{IdMap, IdPair};
use crate::{Copier, GetOptions, Isolation, MkdirOptions, PutOptions, StatOptions};

fn parse_mode(s: &str) -> Result<u32> {
    let mode = u32::from_str_radix(s, 8).with_context(|| format!("Parsing octal mode {s:?}"))?;
    if mode & !0o7777 != 0 {
        anyhow::bail!("Mode {s} has bits outside 07777");
    }
    Ok(mode)
}

fn parse_rename(s: &str) -> Result<(String, String)> {
    let (from, to) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected FROM=TO, found {s:?}"))?;
    Ok((from.to_owned(), to.to_owned()))
}

/// Where to operate.
#[derive(Debug, Parser)]
pub(crate) struct TargetOpts {
    /// The directory treated as `/`.
    pub(crate) root: Utf8PathBuf,

    /// Base for relative paths, itself relative to the root if not absolute.
    #[clap(long, short = 'C', default_value = ".")]
    pub(crate) directory: Utf8PathBuf,
}

/// ID mapping flags shared by the subcommands which change ownership.
#[derive(Debug, Parser)]
pub(crate) struct IdMapOpts {
    /// A UID mapping range, `container:host:size`; may be repeated.
    #[clap(long = "uid-map")]
    pub(crate) uid_map: Vec<IdMap>,

    /// A GID mapping range, `container:host:size`; may be repeated.
    #[clap(long = "gid-map")]
    pub(crate) gid_map: Vec<IdMap>,
}

/// Ownership and permission overrides.
#[derive(Debug, Parser)]
pub(crate) struct OverrideOpts {
    /// Owner for directories, `uid:gid`.
    #[clap(long)]
    pub(crate) chown_dirs: Option<IdPair>,

    /// Permission bits for directories, in octal.
    #[clap(long, value_parser = parse_mode)]
    pub(crate) chmod_dirs: Option<u32>,

    /// Owner for everything but directories, `uid:gid`.
    #[clap(long)]
    pub(crate) chown_files: Option<IdPair>,

    /// Permission bits for everything but directories, in octal.
    #[clap(long, value_parser = parse_mode)]
    pub(crate) chmod_files: Option<u32>,

    /// Rewrite entry names, `FROM=TO`; may be repeated.
    #[clap(long, value_parser = parse_rename)]
    pub(crate) rename: Vec<(String, String)>,
}

impl OverrideOpts {
    fn rename_map(&self) -> BTreeMap<String, String> {
        self.rename.iter().cloned().collect()
    }
}

/// Report on what globs match
#[derive(Debug, Parser)]
pub(crate) struct StatOpts {
    #[clap(flatten)]
    pub(crate) target: TargetOpts,

    /// Check whether regular files are tar archives.
    #[clap(long)]
    pub(crate) check_for_archives: bool,

    /// Exclusion pattern; prefix with `!` to re-include.  May be repeated.
    #[clap(long)]
    pub(crate) exclude: Vec<String>,

    /// Glob patterns, relative to the directory or absolute.
    #[clap(required = true)]
    pub(crate) globs: Vec<String>,
}

/// Archive what globs match as a tar stream
#[derive(Debug, Parser)]
pub(crate) struct GetOpts {
    #[clap(flatten)]
    pub(crate) target: TargetOpts,

    #[clap(flatten)]
    pub(crate) idmap: IdMapOpts,

    #[clap(flatten)]
    pub(crate) overrides: OverrideOpts,

    /// Exclusion pattern; prefix with `!` to re-include.  May be repeated.
    #[clap(long)]
    pub(crate) exclude: Vec<String>,

    /// Inline the contents of matched archives.
    #[clap(long)]
    pub(crate) expand_archives: bool,

    /// Clear setuid, setgid and sticky bits.
    #[clap(long)]
    pub(crate) strip_setid_bits: bool,

    /// Don't archive extended attributes.
    #[clap(long)]
    pub(crate) strip_xattrs: bool,

    /// Prefix the contents of a matched directory with its name.
    #[clap(long)]
    pub(crate) keep_directory_names: bool,

    /// Skip content which cannot be read.
    #[clap(long)]
    pub(crate) ignore_unreadable: bool,

    /// Archive matched symlinks as links rather than their targets.
    #[clap(long)]
    pub(crate) no_deref_symlinks: bool,

    /// Write the stream here instead of stdout.
    #[clap(long, short = 'o')]
    pub(crate) output: Option<Utf8PathBuf>,

    /// Glob patterns, relative to the directory or absolute.
    #[clap(required = true)]
    pub(crate) globs: Vec<String>,
}

/// Extract a tar stream into a directory
#[derive(Debug, Parser)]
pub(crate) struct PutOpts {
    #[clap(flatten)]
    pub(crate) target: TargetOpts,

    #[clap(flatten)]
    pub(crate) idmap: IdMapOpts,

    #[clap(flatten)]
    pub(crate) overrides: OverrideOpts,

    /// Don't set extended attributes.
    #[clap(long)]
    pub(crate) strip_xattrs: bool,

    /// Carry on when an extended attribute cannot be set.
    #[clap(long)]
    pub(crate) ignore_xattr_errors: bool,

    /// Skip character and block devices.
    #[clap(long)]
    pub(crate) ignore_devices: bool,

    /// Read the stream from here instead of stdin.
    #[clap(long, short = 'i')]
    pub(crate) input: Option<Utf8PathBuf>,
}

/// Create a directory and its missing parents
#[derive(Debug, Parser)]
pub(crate) struct MkdirOpts {
    #[clap(flatten)]
    pub(crate) target: TargetOpts,

    #[clap(flatten)]
    pub(crate) idmap: IdMapOpts,

    /// Owner for created directories, `uid:gid` as seen in the container.
    #[clap(long)]
    pub(crate) owner: Option<IdPair>,

    /// Permission bits for created directories, in octal.
    #[clap(long, value_parser = parse_mode)]
    pub(crate) mode: Option<u32>,
}

/// Copy content between directory trees and tar streams, treating a
/// directory as the root filesystem.
#[derive(Debug, Parser)]
#[clap(name = "tarcopy", version)]
#[clap(rename_all = "kebab-case")]
pub(crate) struct Opt {
    /// How to keep operations inside the root.
    #[clap(long, global = true, value_enum, default_value_t = Isolation::Auto)]
    pub(crate) isolation: Isolation,

    #[clap(subcommand)]
    pub(crate) cmd: Command,
}

/// The operations.
#[derive(Debug, clap::Subcommand)]
pub(crate) enum Command {
    /// Print JSON describing what each glob matches.
    Stat(StatOpts),
    /// Write a tar stream of what the globs match.
    Get(GetOpts),
    /// Extract a tar stream into the directory.
    Put(PutOpts),
    /// Print the directory with symlinks resolved inside the root.
    Eval(TargetOpts),
    /// Create the directory.
    Mkdir(MkdirOpts),
}

/// Parse the provided arguments and execute.
/// On a parse failure this prints usage and exits the process.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    let copier = Copier::new().with_isolation(opt.isolation);
    match opt.cmd {
        Command::Stat(opts) => {
            let options = StatOptions {
                check_for_archives: opts.check_for_archives,
                excludes: opts.exclude,
            };
            let t = &opts.target;
            let r = copier
                .stat(&t.root, &t.directory, &options, &opts.globs)
                .await?;
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &r)?;
            writeln!(stdout)?;
            Ok(())
        }
        Command::Get(opts) => {
            let options = GetOptions {
                uid_map: opts.idmap.uid_map,
                gid_map: opts.idmap.gid_map,
                excludes: opts.exclude,
                expand_archives: opts.expand_archives,
                strip_setid_bits: opts.strip_setid_bits,
                strip_xattrs: opts.strip_xattrs,
                keep_directory_names: opts.keep_directory_names,
                ignore_unreadable: opts.ignore_unreadable,
                no_deref_symlinks: opts.no_deref_symlinks,
                chown_dirs: opts.overrides.chown_dirs,
                chmod_dirs: opts.overrides.chmod_dirs,
                chown_files: opts.overrides.chown_files,
                chmod_files: opts.overrides.chmod_files,
                rename: opts.overrides.rename_map(),
            };
            let t = &opts.target;
            match opts.output.as_deref() {
                Some(path) => {
                    let mut f = tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("Creating {path}"))?;
                    copier
                        .get(&t.root, &t.directory, &options, &opts.globs, &mut f)
                        .await?;
                    f.sync_all().await?;
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    copier
                        .get(&t.root, &t.directory, &options, &opts.globs, &mut stdout)
                        .await?;
                    stdout.flush().await?;
                }
            }
            Ok(())
        }
        Command::Put(opts) => {
            let options = PutOptions {
                uid_map: opts.idmap.uid_map,
                gid_map: opts.idmap.gid_map,
                chown_dirs: opts.overrides.chown_dirs,
                chmod_dirs: opts.overrides.chmod_dirs,
                chown_files: opts.overrides.chown_files,
                chmod_files: opts.overrides.chmod_files,
                strip_xattrs: opts.strip_xattrs,
                ignore_xattr_errors: opts.ignore_xattr_errors,
                ignore_devices: opts.ignore_devices,
                rename: opts.overrides.rename_map(),
            };
            let t = &opts.target;
            match opts.input.as_deref() {
                Some(path) => {
                    let f = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("Opening {path}"))?;
                    copier.put(&t.root, &t.directory, &options, f).await
                }
                None => {
                    copier
                        .put(&t.root, &t.directory, &options, tokio::io::stdin())
                        .await
                }
            }
        }
        Command::Eval(t) => {
            let r = copier.eval(&t.root, &t.directory).await?;
            println!("{r}");
            Ok(())
        }
        Command::Mkdir(opts) => {
            let options = MkdirOptions {
                uid_map: opts.idmap.uid_map,
                gid_map: opts.idmap.gid_map,
                chown_new: opts.owner,
                chmod_new: opts.mode,
            };
            let t = &opts.target;
            copier.mkdir(&t.root, &t.directory, &options).await
        }
    }
}

#[test]
fn test_parse_opts() {
    let o = Opt::try_parse_from([
        "tarcopy",
        "get",
        "/srv/root",
        "-C",
        "sub",
        "--uid-map",
        "0:100000:65536",
        "--chmod-files",
        "0644",
        "--rename",
        "a=b",
        "--isolation",
        "in-process",
        "*.txt",
    ])
    .unwrap();
    assert_eq!(o.isolation, Isolation::InProcess);
    match o.cmd {
        Command::Get(opts) => {
            assert_eq!(opts.target.root, "/srv/root");
            assert_eq!(opts.target.directory, "sub");
            assert_eq!(opts.idmap.uid_map[0].host_id, 100000);
            assert_eq!(opts.overrides.chmod_files, Some(0o644));
            assert_eq!(opts.overrides.rename_map().get("a").map(String::as_str), Some("b"));
            assert_eq!(opts.globs, ["*.txt"]);
        }
        o => panic!("Expected get, found {o:?}"),
    }

    assert!(Opt::try_parse_from(["tarcopy", "stat", "/"]).is_err());
    assert!(Opt::try_parse_from(["tarcopy", "mkdir", "/", "--mode", "9"]).is_err());
    assert!(Opt::try_parse_from(["tarcopy", "mkdir", "/", "--mode", "17777"]).is_err());
    assert!(Opt::try_parse_from(["tarcopy", "mkdir", "/", "--owner", "1:2"]).is_ok());
}
