/*
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Process-wide shutdown flag.
//!
//! SIGINT and SIGTERM set a flag that the single-threaded pipelines poll
//! between records and between merge steps, and that the pollexec daemon
//! threads poll in their wait loops. Cleanup then happens on the ordinary
//! unwinding path: streams close and temporary files are removed by their
//! owners' `Drop` implementations.

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Installs the SIGINT/SIGTERM handlers. Call once, early in `main`.
pub fn install_handlers() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("Could not install handler for signal {}", signal));
            }
        }
    }
    Ok(())
}

/// Whether a termination signal has been received.
pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

/// Errors out if a termination signal has been received.
pub fn check() -> Result<()> {
    if requested() {
        bail!("Interrupted");
    }
    Ok(())
}

/// Sets the flag, as the signal handler would.
pub fn trigger() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Whether an error chain bottoms out in a broken pipe. A downstream
/// consumer closing early is a successful exit, not a failure.
pub fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io_err| io_err.kind() == std::io::ErrorKind::BrokenPipe)
}
