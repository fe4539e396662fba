//! The public entry points, and dispatch of requests to the handlers.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::eval::handle_eval;
use crate::mkdir::handle_mkdir;
use crate::stat::handle_stat;
use crate::tar::{handle_get, handle_put};
use crate::tokio_util::{spawn_blocking_flatten, spawn_blocking_reader, spawn_blocking_writer};
use crate::{isolation, Bulk, GetOptions, MkdirOptions, PutOptions, Request, RequestKind};
use crate::{Response, Result, StatOptions, StatsForGlob};

/// The executable re-run as the chroot helper unless configured otherwise.
const DEFAULT_HELPER: &str = "/proc/self/exe";

/// How operations are isolated from the rest of the host filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Isolation {
    /// Use a chroot helper when we are able to, and the root isn't `/`.
    #[default]
    Auto,
    /// Always work in this process, resolving symlinks within the root.
    InProcess,
    /// Always use a helper process which chroots into the root.
    Chroot,
}

/// Normalize and run a request, producing the response and, for a
/// successful Get or Put, the data transfer to perform next.
pub(crate) fn handle(mut req: Request, chroot_root: Option<&Utf8Path>) -> (Response, Option<Bulk>) {
    tracing::debug!("Handling {:?} request", req.kind);
    let r = req.normalize(chroot_root).and_then(|()| dispatch(&req));
    match r {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("{:?} request failed: {e:#}", req.kind);
            (Response::from_error(&e), None)
        }
    }
}

fn dispatch(req: &Request) -> Result<(Response, Option<Bulk>)> {
    let r = match req.kind {
        RequestKind::Stat => (handle_stat(req)?, None),
        RequestKind::Get => {
            let (resp, bulk) = handle_get(req)?;
            (resp, Some(bulk))
        }
        RequestKind::Put => {
            let (resp, bulk) = handle_put(req)?;
            (resp, Some(bulk))
        }
        RequestKind::Eval => (handle_eval(req)?, None),
        RequestKind::Mkdir => (handle_mkdir(req)?, None),
        RequestKind::Quit => anyhow::bail!("Unexpected QUIT request"),
    };
    Ok(r)
}

/// Runs requests, either in this process or in a chroot helper.
#[derive(Debug, Clone, Default)]
pub struct Copier {
    isolation: Isolation,
    helper: Option<Utf8PathBuf>,
}

impl Copier {
    /// A copier with automatic isolation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose how operations are isolated.
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Use `helper` as the chroot helper executable.  It must call
    /// [`isolation::maybe_exec_child`] first thing in `main`.
    pub fn with_helper(mut self, helper: impl Into<Utf8PathBuf>) -> Self {
        self.helper = Some(helper.into());
        self
    }

    fn use_chroot(&self, root: &Utf8Path) -> bool {
        match self.isolation {
            Isolation::InProcess => false,
            Isolation::Chroot => true,
            Isolation::Auto => {
                cfg!(target_os = "linux")
                    && rustix::process::geteuid().is_root()
                    && tarcopy_utils::clean(root) != "/"
            }
        }
    }

    async fn run(
        &self,
        req: Request,
        src: Option<&mut (dyn AsyncRead + Unpin + Send)>,
        dest: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    ) -> Result<Response> {
        if self.use_chroot(&req.root) {
            anyhow::ensure!(
                req.root.is_absolute(),
                "Root {} is not an absolute path",
                req.root
            );
            let helper = self
                .helper
                .as_deref()
                .unwrap_or(Utf8Path::new(DEFAULT_HELPER));
            return isolation::run_in_chroot(helper, &req, src, dest)
                .await?
                .into_result();
        }
        let (resp, bulk) = spawn_blocking_flatten(move || Ok(handle(req, None))).await?;
        let resp = resp.into_result()?;
        match (bulk, src, dest) {
            (None, _, _) => {}
            (Some(Bulk::Get(f)), _, Some(dest)) => spawn_blocking_writer(dest, f).await?,
            (Some(Bulk::Put(f)), Some(src), _) => spawn_blocking_reader(src, f).await?,
            (Some(bulk), _, _) => anyhow::bail!("No stream for {bulk:?}"),
        }
        Ok(resp)
    }

    /// Examine what each of `globs` matches below `directory`.
    pub async fn stat(
        &self,
        root: impl AsRef<Utf8Path>,
        directory: impl AsRef<Utf8Path>,
        options: &StatOptions,
        globs: &[impl AsRef<str>],
    ) -> Result<Vec<StatsForGlob>> {
        let mut req = Request::new(RequestKind::Stat, root.as_ref(), directory.as_ref());
        req.globs = globs.iter().map(|g| g.as_ref().to_owned()).collect();
        req.stat_options = options.clone();
        Ok(self.run(req, None, None).await?.stat)
    }

    /// Write a tar stream of what `globs` match below `directory` to `dest`.
    pub async fn get(
        &self,
        root: impl AsRef<Utf8Path>,
        directory: impl AsRef<Utf8Path>,
        options: &GetOptions,
        globs: &[impl AsRef<str>],
        mut dest: impl AsyncWrite + Send + Unpin,
    ) -> Result<()> {
        let mut req = Request::new(RequestKind::Get, root.as_ref(), directory.as_ref());
        req.globs = globs.iter().map(|g| g.as_ref().to_owned()).collect();
        req.get_options = options.clone();
        self.run(req, None, Some(&mut dest)).await?;
        Ok(())
    }

    /// Extract the tar stream `src` into `directory`.
    pub async fn put(
        &self,
        root: impl AsRef<Utf8Path>,
        directory: impl AsRef<Utf8Path>,
        options: &PutOptions,
        mut src: impl AsyncRead + Send + Unpin,
    ) -> Result<()> {
        let mut req = Request::new(RequestKind::Put, root.as_ref(), directory.as_ref());
        req.put_options = options.clone();
        self.run(req, Some(&mut src), None).await?;
        Ok(())
    }

    /// Resolve `directory` through symlinks as if `root` were `/`.  The
    /// result is a host path.
    pub async fn eval(
        &self,
        root: impl AsRef<Utf8Path>,
        directory: impl AsRef<Utf8Path>,
    ) -> Result<Utf8PathBuf> {
        let req = Request::new(RequestKind::Eval, root.as_ref(), directory.as_ref());
        self.run(req, None, None)
            .await?
            .eval
            .ok_or_else(|| anyhow::anyhow!("No result from eval"))
    }

    /// Create `directory` and any missing parents below `root`.
    pub async fn mkdir(
        &self,
        root: impl AsRef<Utf8Path>,
        directory: impl AsRef<Utf8Path>,
        options: &MkdirOptions,
    ) -> Result<()> {
        let mut req = Request::new(RequestKind::Mkdir, root.as_ref(), directory.as_ref());
        req.mkdir_options = options.clone();
        self.run(req, None, None).await?;
        Ok(())
    }
}

/// [`Copier::stat`] with automatic isolation.
pub async fn stat(
    root: impl AsRef<Utf8Path>,
    directory: impl AsRef<Utf8Path>,
    options: &StatOptions,
    globs: &[impl AsRef<str>],
) -> Result<Vec<StatsForGlob>> {
    Copier::new().stat(root, directory, options, globs).await
}

/// [`Copier::get`] with automatic isolation.
pub async fn get(
    root: impl AsRef<Utf8Path>,
    directory: impl AsRef<Utf8Path>,
    options: &GetOptions,
    globs: &[impl AsRef<str>],
    dest: impl AsyncWrite + Send + Unpin,
) -> Result<()> {
    Copier::new().get(root, directory, options, globs, dest).await
}

/// [`Copier::put`] with automatic isolation.
pub async fn put(
    root: impl AsRef<Utf8Path>,
    directory: impl AsRef<Utf8Path>,
    options: &PutOptions,
    src: impl AsyncRead + Send + Unpin,
) -> Result<()> {
    Copier::new().put(root, directory, options, src).await
}

/// [`Copier::eval`] with automatic isolation.
pub async fn eval(root: impl AsRef<Utf8Path>, directory: impl AsRef<Utf8Path>) -> Result<Utf8PathBuf> {
    Copier::new().eval(root, directory).await
}

/// [`Copier::mkdir`] with automatic isolation.
pub async fn mkdir(
    root: impl AsRef<Utf8Path>,
    directory: impl AsRef<Utf8Path>,
    options: &MkdirOptions,
) -> Result<()> {
    Copier::new().mkdir(root, directory, options).await
}
