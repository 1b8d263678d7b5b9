//! # MB Harness - Main Entry Point
//!
//! 1. **Initialize logging**: colored tracing output filtered by `RUST_LOG`
//! 2. **Parse arguments**: the single positional configuration path
//! 3. **Install signal handling**: Ctrl-C or SIGTERM cancel the run
//! 4. **Run the harness**: consumers, startup delay, publishers, wait, report
//! 5. **Shut down**: stop publishers, then consumers, then flush outputs
//!
//! Configuration and startup failures surface as an error exit; the shutdown
//! hook has already stopped whatever was started by then.

use anyhow::Result;
use clap::Parser;
use mb_harness::{
    cli::Args,
    harness::{CancelHandle, Cancellation, Harness, HarnessOptions},
    SocketClientFactory, VERSION,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    mb_harness::logging::init();

    let args = Args::parse();
    info!("Starting MB Harness v{}", VERSION);

    let (cancel_handle, cancellation) = Cancellation::new();
    tokio::spawn(cancel_on_signal(cancel_handle));

    let harness = Harness::new(SocketClientFactory::new(), HarnessOptions::default());
    let run = harness.run(&args.config, &cancellation).await?;

    // Publisher-only runs return from the harness right away; keep the
    // process alive until the publishers are through.
    run.await_background(&cancellation).await;

    let interrupted = run.summary().interrupted;
    run.shutdown();

    if interrupted {
        warn!("MB Harness interrupted");
    } else {
        info!("MB Harness finished");
    }
    Ok(())
}

async fn cancel_on_signal(handle: CancelHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return wait_for_ctrl_c(&handle).await;
            }
        };
        tokio::select! {
            _ = terminate.recv() => {
                warn!("SIGTERM received, shutting down");
                handle.cancel();
            }
            _ = wait_for_ctrl_c(&handle) => {}
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c(&handle).await;
}

async fn wait_for_ctrl_c(handle: &CancelHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupt received, shutting down");
            handle.cancel();
        }
        Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
    }
}
