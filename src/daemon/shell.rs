/*
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Picking a shell whose `-c` invocation `exec`s its command.
//!
//! Timed signal escalation only works if the signals reach the actual
//! workload, not a shell wrapper that may or may not forward them. Each
//! candidate shell is probed by running this very binary through
//! `shell -c`: the re-executed child compares its parent pid with the
//! marker the daemon put in the environment, so a shell that forks an
//! extra level fails the probe.

use anyhow::Result;
use std::path::PathBuf;
use std::process::Command;

/// Overrides the probe entirely.
pub const SHELL_ENV: &str = "FLOWKIT_SHELL";
/// Carries the prober's pid to the probe child.
pub const PROBE_ENV: &str = "FLOWKIT_PROBE_PPID";

/// Probe child: parent pid mismatch (the shell forked).
pub const EXIT_PPID_MISMATCH: i32 = 2;
/// Probe child: unusable marker.
pub const EXIT_BAD_MARKER: i32 = 3;

const CANDIDATES: [&str; 3] = ["/bin/sh", "/bin/bash", "/bin/ksh"];

/// To be called first thing in `main`: when the probe marker is present
/// this process *is* the probe child, and it exits with the verdict
/// instead of running the CLI.
pub fn maybe_run_probe_child() {
    let Some(marker) = std::env::var_os(PROBE_ENV) else {
        return;
    };
    let Ok(expected) = marker.to_string_lossy().parse::<i32>() else {
        std::process::exit(EXIT_BAD_MARKER);
    };
    let parent = unsafe { libc::getppid() };
    std::process::exit(if parent == expected {
        0
    } else {
        EXIT_PPID_MISMATCH
    });
}

/// Selects the shell used to run daemon commands: the [`SHELL_ENV`]
/// override if set, otherwise the first candidate that passes the exec
/// probe, otherwise the first candidate with a warning.
pub fn select_shell() -> Result<PathBuf> {
    if let Some(shell) = std::env::var_os(SHELL_ENV) {
        log::info!("Using shell {:?} from ${}", shell, SHELL_ENV);
        return Ok(PathBuf::from(shell));
    }
    for candidate in CANDIDATES {
        if !std::path::Path::new(candidate).exists() {
            continue;
        }
        match probe(candidate) {
            Ok(true) => {
                log::debug!("Shell {} passed the exec probe", candidate);
                return Ok(PathBuf::from(candidate));
            }
            Ok(false) => log::debug!("Shell {} forks its command; skipping", candidate),
            Err(err) => log::debug!("Could not probe shell {}: {}", candidate, err),
        }
    }
    log::warn!(
        "No candidate shell passed the exec probe; signals may not reach commands. Set ${} to override.",
        SHELL_ENV
    );
    Ok(PathBuf::from(CANDIDATES[0]))
}

fn probe(shell: &str) -> Result<bool> {
    let exe = std::env::current_exe()?;
    let marker = std::process::id().to_string();
    let status = Command::new(shell)
        .arg("-c")
        .arg(exe.display().to_string())
        .env(PROBE_ENV, marker)
        .status()?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_shell_env_override() {
        // The override bypasses the probe, so no subprocess is involved.
        std::env::set_var(SHELL_ENV, "/bin/dash");
        let shell = select_shell().unwrap();
        std::env::remove_var(SHELL_ENV);
        assert_eq!(shell, PathBuf::from("/bin/dash"));
    }
}
