//! The Eval handler.

use tracing::instrument;

use crate::resolve::resolve;
use crate::{Request, Response, Result};

/// Resolve the request's directory through any symlinks, and report it
/// the way the caller sees the filesystem.
#[instrument(level = "debug", skip_all)]
pub(crate) fn handle_eval(req: &Request) -> Result<Response> {
    let resolved = resolve(&req.root, &req.directory, None)?;
    Ok(Response {
        eval: Some(req.caller_path(&resolved)),
        ..Default::default()
    })
}
