//! # Running requests in a chroot helper
//!
//! When the root is a real subtree of the host, requests are handled by a
//! helper process which calls `chroot(2)` into it before touching anything,
//! so the kernel rather than our own path resolution keeps symlinks
//! inside the root.
//!
//! The helper is this same executable, started with [`CHILD_ARGV0`] as
//! `argv[0]`; its `main` must call [`maybe_exec_child`] before doing anything
//! else.  The control channel is one JSON record per line: the parent writes
//! the session options, then a request, and reads back a response.  The tar
//! stream of a Put is passed in on fd [`BULK_IN_FD`], and that of a Get comes
//! back on fd [`BULK_OUT_FD`].  Once the Put stream has been written, the
//! parent sends a QUIT request.
//!
//! The helper logs to stderr; if it exits unsuccessfully, that text is the
//! error the caller sees.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::os::fd::FromRawFd;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use camino::Utf8Path;
use cap_std_ext::cmdext::CapStdExtCommandExt;
use fn_error_context::context;
use rustix::pipe::{pipe_with, PipeFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;
use tracing::level_filters::LevelFilter;

use crate::copier::handle;
use crate::{Bulk, Request, RequestKind, Response, Result, SessionOptions};

/// The `argv[0]` which makes a process act as the chroot helper.
pub const CHILD_ARGV0: &str = "tarcopy-chroot-helper";
/// The helper's log level, e.g. `debug`.
pub const LOG_LEVEL_ENV: &str = "TARCOPY_LOG_LEVEL";
/// The helper reads a Put's tar stream from this descriptor.
pub const BULK_IN_FD: i32 = 3;
/// The helper writes a Get's tar stream to this descriptor.
pub const BULK_OUT_FD: i32 = 4;

async fn send_record(w: &mut (impl AsyncWrite + Unpin), v: &impl Serialize) -> Result<()> {
    let mut buf = serde_json::to_vec(v)?;
    buf.push(b'\n');
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Copy a Put's tar stream to the helper, if there is one, and then end
/// the session with a QUIT request.
async fn finish_input(
    src: Option<&mut (dyn AsyncRead + Unpin + Send)>,
    bulk_in: &mut (impl AsyncWrite + Unpin),
    control: &mut (impl AsyncWrite + Unpin),
) -> Result<()> {
    if let Some(src) = src {
        tokio::io::copy(src, bulk_in).await?;
    }
    bulk_in.shutdown().await?;
    send_record(control, &Request::new(RequestKind::Quit, "/", "/")).await?;
    control.shutdown().await?;
    Ok(())
}

/// The error for a helper which exited unsuccessfully.
fn helper_failure(status: std::process::ExitStatus, stderr: &str) -> anyhow::Error {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        anyhow!("subprocess exited with error: {status}")
    } else {
        anyhow!("{stderr}")
    }
}

/// Run `req` in a helper chrooted into its root.  `src` is the tar stream
/// for a Put; `dest` receives the stream of a Get.
#[instrument(level = "debug", skip_all, fields(kind = ?req.kind))]
pub(crate) async fn run_in_chroot(
    helper: &Utf8Path,
    req: &Request,
    src: Option<&mut (dyn AsyncRead + Unpin + Send)>,
    dest: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
) -> Result<Response> {
    let (bulk_in_reader, bulk_in_writer) = pipe_with(PipeFlags::CLOEXEC)?;
    let (bulk_out_reader, bulk_out_writer) = pipe_with(PipeFlags::CLOEXEC)?;

    let mut c = std::process::Command::new(helper);
    c.arg0(CHILD_ARGV0)
        .env(LOG_LEVEL_ENV, LevelFilter::current().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    c.take_fd_n(Arc::new(bulk_in_reader), BULK_IN_FD);
    c.take_fd_n(Arc::new(bulk_out_writer), BULK_OUT_FD);
    let mut c = tokio::process::Command::from(c);
    c.kill_on_drop(true);
    let mut child = c.spawn().with_context(|| format!("Spawning {helper}"))?;
    // This closes our copies of the helper's ends of the pipes.
    drop(c);

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("Missing helper stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("Missing helper stdout"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("Missing helper stderr"))?;
    let stderr = tokio::spawn(async move {
        let mut buf = String::new();
        stderr.read_to_string(&mut buf).await?;
        Ok::<_, anyhow::Error>(buf)
    });

    let session = SessionOptions {
        root: tarcopy_utils::clean(&req.root),
        directory: req.directory.clone(),
    };
    let exchange = async {
        let mut stdout = tokio::io::BufReader::new(stdout).lines();
        send_record(&mut stdin, &session).await?;
        send_record(&mut stdin, req).await?;
        let line = stdout
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("Helper exited without responding"))?;
        let resp: Response = serde_json::from_str(&line).context("Parsing helper response")?;
        Ok::<_, anyhow::Error>(resp)
    };
    let resp = match exchange.await {
        Ok(resp) => resp,
        Err(e) => {
            // The helper may be blocked on one of the bulk pipes.
            let _ = child.start_kill();
            let status = child.wait().await?;
            let stderr = stderr.await??;
            if stderr.trim().is_empty() {
                return Err(e);
            }
            tracing::debug!("Exchange with helper failed: {e:#}");
            return Err(helper_failure(status, &stderr));
        }
    };
    let transfer = resp.error.is_none();

    // The helper sees the end of the stream and then QUIT; both ends are
    // closed once this finishes.
    let feed = async move {
        let mut tx = tokio::net::unix::pipe::Sender::from_owned_fd(bulk_in_writer)?;
        let src = if transfer { src } else { None };
        finish_input(src, &mut tx, &mut stdin).await
    };
    let drain = async move {
        if let (true, Some(dest)) = (transfer, dest) {
            let mut rx = tokio::net::unix::pipe::Receiver::from_owned_fd(bulk_out_reader)?;
            tokio::io::copy(&mut rx, dest).await?;
            dest.flush().await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let (fed, drained, status) = tokio::join!(feed, drain, child.wait());
    let status = status?;
    let stderr = stderr.await??;
    if !status.success() {
        if let Err(e) = fed.as_ref().and(drained.as_ref()) {
            tracing::debug!("Transfer with failed helper: {e:#}");
        }
        return Err(helper_failure(status, &stderr));
    }
    if !stderr.is_empty() {
        tracing::debug!("Helper output: {}", stderr.trim_end());
    }
    fed?;
    drained?;
    Ok(resp)
}

/// If this process was started as the chroot helper, serve the parent and
/// exit; otherwise return without doing anything.
pub fn maybe_exec_child() {
    let is_child = std::env::args_os()
        .next()
        .is_some_and(|arg0| arg0 == CHILD_ARGV0);
    if !is_child {
        return;
    }
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_default();
    tarcopy_utils::initialize_tracing_at(&level);
    let code = match run_child() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e:#}");
            1
        }
    };
    std::process::exit(code)
}

fn read_record<T: DeserializeOwned>(r: &mut impl BufRead) -> Result<Option<T>> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line)?))
}

fn write_record(w: &mut impl Write, v: &impl Serialize) -> Result<()> {
    serde_json::to_writer(&mut *w, v)?;
    w.write_all(b"\n")?;
    w.flush()?;
    Ok(())
}

#[context("chroot {root}")]
fn enter_chroot(root: &Utf8Path) -> Result<()> {
    rustix::process::chroot(root.as_std_path())?;
    std::env::set_current_dir("/")?;
    Ok(())
}

fn run_child() -> Result<()> {
    let mut input = std::io::stdin().lock();
    let mut output = std::io::stdout().lock();
    let session: SessionOptions =
        read_record(&mut input)?.ok_or_else(|| anyhow!("No session options received"))?;
    enter_chroot(&session.root)?;
    tracing::debug!("Serving {} for {}", session.root, session.directory);

    #[allow(unsafe_code)]
    // SAFETY: The parent sets up these descriptors for us, and nothing else
    // in this process owns them.
    let (mut bulk_in, bulk_out) = unsafe {
        (
            File::from_raw_fd(BULK_IN_FD),
            File::from_raw_fd(BULK_OUT_FD),
        )
    };
    let mut bulk_out = BufWriter::new(bulk_out);
    while let Some(req) = read_record::<Request>(&mut input)? {
        if req.kind == RequestKind::Quit {
            break;
        }
        let (resp, bulk) = handle(req, Some(session.root.as_path()));
        write_record(&mut output, &resp)?;
        match bulk {
            Some(Bulk::Get(f)) => {
                f(&mut bulk_out)?;
                bulk_out.flush()?;
            }
            Some(Bulk::Put(f)) => f(&mut bulk_in)?,
            None => {}
        }
    }
    Ok(())
}
