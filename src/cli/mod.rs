/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Command line interface structs and functions, organized by subcommands.

use crate::io::{IpPolicy, Metadata, RecordReader};
use anyhow::{anyhow, ensure, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

pub mod bag;
pub mod bagtool;
pub mod dedupe;
pub mod pollexec;
pub mod sort;

/// Parses a byte size with an optional SI or NIST multiplier (k, M, G, T,
/// ki, Mi, Gi, Ti).
///
/// This function is meant to be used with `#[arg(..., value_parser =
/// byte_size_parser)]`.
pub fn byte_size_parser(arg: &str) -> Result<usize> {
    const PREF_SYMS: [(&str, u64); 8] = [
        ("ki", 1 << 10),
        ("mi", 1 << 20),
        ("gi", 1 << 30),
        ("ti", 1 << 40),
        ("k", 1E3 as u64),
        ("m", 1E6 as u64),
        ("g", 1E9 as u64),
        ("t", 1E12 as u64),
    ];
    let arg = arg.trim().to_ascii_lowercase();
    ensure!(!arg.is_empty(), "empty string");
    let num_digits = arg
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .count();
    let number = arg[..num_digits].parse::<f64>()?;
    let suffix = arg[num_digits..].trim();
    let prefix = suffix.strip_suffix('b').unwrap_or(suffix);
    let multiplier = if prefix.is_empty() {
        1
    } else {
        PREF_SYMS
            .iter()
            .find(|(sym, _)| *sym == prefix)
            .map(|(_, multiplier)| *multiplier)
            .ok_or(anyhow!("invalid size suffix {:?}", suffix))?
    };
    let value = (number * multiplier as f64) as usize;
    ensure!(value > 0, "size must be greater than zero");
    Ok(value)
}

/// Parses a duration: seconds by default, with optional `s`, `m`, `h`, or
/// `d` suffix.
pub fn duration_parser(arg: &str) -> Result<Duration> {
    let arg = arg.trim();
    ensure!(!arg.is_empty(), "empty duration");
    let (number, unit) = match arg.find(|c: char| !c.is_ascii_digit()) {
        None => (arg, "s"),
        Some(split) => arg.split_at(split),
    };
    let number: u64 = number.parse()?;
    Ok(match unit.trim() {
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 60 * 60),
        "d" => Duration::from_secs(number * 60 * 60 * 24),
        other => anyhow::bail!("invalid duration suffix {:?}", other),
    })
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    #[arg(long, value_parser = duration_parser, global = true, display_order = 1000)]
    /// How often to log progress. Default is 10s. You can use the suffixes
    /// "s", "m", "h", and "d"; a bare number is seconds.
    pub log_interval: Option<Duration>,
}

/// Shared CLI arguments for the memory budget of the external sorter.
#[derive(Args, Debug)]
pub struct BufferSizeArg {
    #[arg(long, value_parser = byte_size_parser, default_value = "64Mi")]
    /// The in-memory buffer budget, in bytes; accepts the SI and NIST
    /// multipliers k, M, G, T, ki, Mi, Gi, and Ti.
    pub buffer_size: usize,
}

/// Shared CLI arguments for the temporary-file directory.
#[derive(Args, Debug)]
pub struct TempDirArg {
    #[arg(long)]
    /// Where to keep temporary files; defaults to $FLOWKIT_TMPDIR, then
    /// the system temporary directory.
    pub temp_directory: Option<PathBuf>,
}

/// Shared CLI arguments for the metadata block of the outputs.
#[derive(Args, Debug)]
pub struct MetadataArgs {
    #[arg(long)]
    /// Add an annotation to the output; repeatable.
    pub note_add: Vec<String>,

    #[arg(long)]
    /// Do not copy annotations from the inputs.
    pub notes_strip: bool,

    #[arg(long)]
    /// Do not record this invocation in the output.
    pub invocation_strip: bool,
}

impl MetadataArgs {
    /// Builds the output metadata block: the inputs' entries, minus
    /// whatever stripping was requested, plus new notes and this
    /// invocation.
    pub fn metadata(&self, from_inputs: Metadata) -> Metadata {
        let invocation = if self.invocation_strip {
            None
        } else {
            Some(current_invocation())
        };
        from_inputs.finalize(invocation, &self.note_add, self.notes_strip)
    }
}

/// Shared CLI arguments for the output sink and its metadata block.
#[derive(Args, Debug)]
pub struct OutputArgs {
    #[arg(long, short = 'o', default_value = "-")]
    /// The output path; `-` is standard output.
    pub output_path: PathBuf,

    #[clap(flatten)]
    pub meta: MetadataArgs,
}

impl OutputArgs {
    pub fn metadata(&self, from_inputs: Metadata) -> Metadata {
        self.meta.metadata(from_inputs)
    }
}

/// Shared CLI argument for the per-stream IPv6 policy.
#[derive(Args, Debug)]
pub struct Ipv6PolicyArg {
    #[arg(long, value_enum, default_value = "mix")]
    /// How IPv6 records are handled while reading.
    pub ipv6_policy: IpPolicy,
}

/// The command line of the current process, as recorded in output headers.
pub fn current_invocation() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}

/// Collects the merged metadata block of a list of record inputs by
/// opening each one for its header. Standard-input entries are skipped:
/// their header can only be read once, by whoever consumes the records.
pub fn collect_input_metadata(inputs: &[PathBuf]) -> Result<Metadata> {
    let mut metadata = Metadata::default();
    for input in inputs {
        if crate::io::is_stdio(input) {
            continue;
        }
        metadata.merge(RecordReader::open(input)?.metadata());
    }
    Ok(metadata)
}

#[derive(Subcommand, Debug)]
pub enum SubCommands {
    Sort(sort::CliArgs),
    Dedupe(dedupe::CliArgs),
    Bag(bag::CliArgs),
    Bagtool(bagtool::CliArgs),
    Pollexec(pollexec::CliArgs),
}

#[derive(Parser, Debug)]
#[command(name = "flowkit", version)]
/// Tools to sort, deduplicate, and aggregate network flow-record corpora.
pub struct Cli {
    #[command(subcommand)]
    pub command: SubCommands,
    #[clap(flatten)]
    pub args: GlobalArgs,
}

/// The entry point of the command-line interface.
pub fn cli_main<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let start = std::time::Instant::now();
    let cli = Cli::parse_from(args);
    match cli.command {
        SubCommands::Sort(args) => sort::main(cli.args, args)?,
        SubCommands::Dedupe(args) => dedupe::main(cli.args, args)?,
        SubCommands::Bag(args) => bag::main(cli.args, args)?,
        SubCommands::Bagtool(args) => bagtool::main(cli.args, args)?,
        SubCommands::Pollexec(args) => pollexec::main(cli.args, args)?,
    }
    log::info!("The command took {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Initializes the `env_logger` logger with a custom format including
/// timestamps.
pub fn init_env_logger() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(move |buf, record| {
        let Ok(ts) = jiff::Timestamp::try_from(SystemTime::now()) else {
            return Err(std::io::Error::other("Failed to get timestamp"));
        };
        let style = buf.default_level_style(record.level());
        writeln!(
            buf,
            "{} {style}{}{style:#} {} - {}",
            ts.strftime("%F %T%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_parser() {
        assert_eq!(byte_size_parser("1024").unwrap(), 1024);
        assert_eq!(byte_size_parser("4k").unwrap(), 4000);
        assert_eq!(byte_size_parser("4ki").unwrap(), 4096);
        assert_eq!(byte_size_parser("1.5Mi").unwrap(), 3 << 19);
        assert_eq!(byte_size_parser("2G").unwrap(), 2_000_000_000);
        assert_eq!(byte_size_parser("64MiB").unwrap(), 64 << 20);
        assert!(byte_size_parser("").is_err());
        assert!(byte_size_parser("12q").is_err());
        assert!(byte_size_parser("0").is_err());
    }

    #[test]
    fn test_duration_parser() {
        assert_eq!(duration_parser("30").unwrap(), Duration::from_secs(30));
        assert_eq!(duration_parser("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(duration_parser("1h").unwrap(), Duration::from_secs(3600));
        assert!(duration_parser("5x").is_err());
    }

    #[test]
    fn test_cli_asserts() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
