/*
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use flowkit::cli::{cli_main, init_env_logger};
use flowkit::daemon::shell::maybe_run_probe_child;
use flowkit::shutdown;
use std::process::ExitCode;

pub fn main() -> ExitCode {
    // When the shell-probe marker is in the environment this process is
    // the probe child; it exits with the verdict in here.
    maybe_run_probe_child();
    if init_env_logger().is_err() {
        eprintln!("Could not initialize logging");
        return ExitCode::FAILURE;
    }
    if let Err(err) = shutdown::install_handlers() {
        eprintln!("{:#}", err);
        return ExitCode::FAILURE;
    }
    match cli_main(std::env::args_os()) {
        Ok(()) => ExitCode::SUCCESS,
        // The downstream consumer went away; that is a successful exit.
        Err(err) if shutdown::is_broken_pipe(&err) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
