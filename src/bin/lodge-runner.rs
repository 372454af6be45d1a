//! Worker extension: runs one guest on behalf of a kernel.
//!
//! The spawn request arrives as JSON on stdin. The guest's output goes to the
//! kernel's output channel and the guest's exit code becomes ours.

use lodge::kernel::{Kernel, SpawnRequest, ThreadWorker};
use lodge::runner::{self, RunnerError};
use std::io::{Read, Write};
use std::process::exit;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// The request could not be read.
const EXIT_BAD_REQUEST: i32 = 126;

/// The guest could not be started.
const EXIT_CANNOT_RUN: i32 = 127;

fn main() {
    setup_logging();

    let request = match read_request() {
        Ok(request) => request,
        Err(err) => {
            error!("{err}");
            exit(EXIT_BAD_REQUEST);
        }
    };
    info!(
        "running {} for request {}",
        request.path.display(),
        request.request_id
    );

    lodge::bypass::init_bypass();
    lodge::guest::install_hooks();
    if let Err(err) = lodge::bypass::set_guest_executable_path(&request.path) {
        warn!("guest path not recorded: {err}");
    }
    if request.in_process {
        // Processes the guest starts run beside it, their output going where
        // the guest's does.
        let kernel = Kernel::builder().worker(ThreadWorker::new()).build();
        let printer = kernel.on_output(|_, bytes| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(bytes);
            let _ = stdout.flush();
        });
        if let Err(err) = printer {
            warn!("nested output dropped: {err}");
        }
        kernel.attach_guest_hooks();
    }

    match runner::run(&request) {
        Ok(code) => exit(code),
        Err(err) => {
            error!("{err}");
            exit(EXIT_CANNOT_RUN);
        }
    }
}

fn read_request() -> lodge::Result<SpawnRequest> {
    let mut payload = Vec::new();
    std::io::stdin().read_to_end(&mut payload)?;
    let request = serde_json::from_slice(&payload).map_err(RunnerError::from)?;
    Ok(request)
}

/// Logs go to the stderr we were started with, which a module guest's
/// redirection of fd 2 leaves alone.
fn setup_logging() {
    let stderr = runner::OriginalStderr::capture();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(move || stderr)
        .init();
}
