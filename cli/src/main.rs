//! The `tarcopy` command.

use anyhow::Result;

async fn run() -> Result<()> {
    tarcopy_utils::initialize_tracing();
    tracing::trace!("starting");
    tarcopy_lib::cli::run_from_iter(std::env::args()).await
}

fn main() {
    // This must come before starting any threads; the chroot helper is
    // single threaded.
    tarcopy_lib::isolation::maybe_exec_child();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let r = runtime
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(run()));
    if let Err(e) = r {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
