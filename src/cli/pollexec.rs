/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{duration_parser, GlobalArgs};
use crate::daemon::{self, PollExecConfig, MAX_SIMULTANEOUS};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    about = "Watch a directory and run a command on every file that arrives, archiving or quarantining it by exit status."
)]
pub struct CliArgs {
    #[arg(long, required = true)]
    /// The directory to watch for incoming files.
    pub incoming_directory: PathBuf,

    #[arg(long, required = true)]
    /// Where files go when their command fails.
    pub error_directory: PathBuf,

    #[arg(long)]
    /// Where files go when their command succeeds; without it they are
    /// deleted.
    pub archive_directory: Option<PathBuf>,

    #[arg(long)]
    /// Archive into the directory itself instead of a YYYY/MM/DD/HH tree.
    pub flat_archive: bool,

    #[arg(long, required = true)]
    /// The command to run on each file; `%s` is replaced by the file path.
    pub command: String,

    #[arg(long)]
    /// A command to run on each file after it is archived; `%s` is
    /// replaced by the archived path.
    pub post_archive_command: Option<String>,

    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..=MAX_SIMULTANEOUS as u64))]
    /// How many commands may run in parallel.
    pub simultaneous: u64,

    #[arg(long = "timeout", value_parser = timeout_parser)]
    /// Send SIGNAL to a command still running after SECS seconds, as
    /// SIGNAL,SECS; repeatable, later delays measured from the previous
    /// signal.
    pub timeouts: Vec<(i32, u64)>,

    #[arg(long, value_parser = duration_parser, default_value = "15")]
    /// How often to scan the incoming directory, in seconds unless
    /// suffixed.
    pub polling_interval: Duration,
}

/// Parses `SIGNAL,SECS`, accepting signal names or numbers.
pub fn timeout_parser(arg: &str) -> Result<(i32, u64)> {
    let Some((signal, delay)) = arg.split_once(',') else {
        bail!("{:?} is not SIGNAL,SECS", arg);
    };
    let signal = parse_signal(signal.trim())?;
    let delay: u64 = delay
        .trim()
        .parse()
        .with_context(|| format!("Bad delay in {:?}", arg))?;
    Ok((signal, delay))
}

fn parse_signal(name: &str) -> Result<i32> {
    if let Ok(number) = name.parse::<i32>() {
        return Ok(number);
    }
    Ok(
        match name
            .to_ascii_uppercase()
            .trim_start_matches("SIG")
            .to_owned()
            .as_str()
        {
            "HUP" => libc::SIGHUP,
            "INT" => libc::SIGINT,
            "QUIT" => libc::SIGQUIT,
            "KILL" => libc::SIGKILL,
            "USR1" => libc::SIGUSR1,
            "USR2" => libc::SIGUSR2,
            "TERM" => libc::SIGTERM,
            other => bail!("Unknown signal {:?}", other),
        },
    )
}

pub fn main(_global_args: GlobalArgs, args: CliArgs) -> Result<()> {
    let config = PollExecConfig {
        incoming_dir: args.incoming_directory,
        error_dir: args.error_directory,
        archive_dir: args.archive_directory,
        flat_archive: args.flat_archive,
        command: args.command,
        post_archive_command: args.post_archive_command,
        simultaneous: args.simultaneous as usize,
        timeouts: args.timeouts,
        polling_interval: args.polling_interval,
        ..Default::default()
    };
    daemon::run(config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_parser() {
        assert_eq!(timeout_parser("TERM,3").unwrap(), (libc::SIGTERM, 3));
        assert_eq!(timeout_parser("SIGKILL,5").unwrap(), (libc::SIGKILL, 5));
        assert_eq!(timeout_parser("9,5").unwrap(), (9, 5));
        assert!(timeout_parser("TERM").is_err());
        assert!(timeout_parser("WAT,1").is_err());
        assert!(timeout_parser("TERM,x").is_err());
    }
}
