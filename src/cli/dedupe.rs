/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{BufferSizeArg, GlobalArgs, Ipv6PolicyArg, OutputArgs, TempDirArg};
use crate::dedupe::{DedupeConfig, Deduper};
use crate::fields::parse_field_list;
use crate::io::{Metadata, RecordReader, RecordWriter};
use crate::shutdown;
use crate::sorter::{ExternalSorter, SorterConfig, DEFAULT_MERGE_FANIN};
use crate::spool::TempSpool;
use anyhow::Result;
use clap::Parser;
use dsi_progress_logger::prelude::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    about = "Drop duplicate flow records, optionally tolerating small differences in counters and times."
)]
pub struct CliArgs {
    /// Input corpora; `-` is standard input.
    pub inputs: Vec<PathBuf>,

    #[arg(long)]
    /// Comma-separated fields excluded from the comparison.
    pub ignore_fields: Option<String>,

    #[arg(long, default_value_t = 0)]
    /// Tolerated difference in the packet count.
    pub packets_delta: u32,

    #[arg(long, default_value_t = 0)]
    /// Tolerated difference in the byte count.
    pub bytes_delta: u32,

    #[arg(long, default_value_t = 0)]
    /// Tolerated difference in the start time, in milliseconds.
    pub stime_delta: u64,

    #[arg(long, default_value_t = 0)]
    /// Tolerated difference in the duration, in milliseconds.
    pub duration_delta: u32,

    #[clap(flatten)]
    pub buffer: BufferSizeArg,

    #[clap(flatten)]
    pub temp: TempDirArg,

    #[clap(flatten)]
    pub policy: Ipv6PolicyArg,

    #[clap(flatten)]
    pub output: OutputArgs,
}

pub fn main(global_args: GlobalArgs, args: CliArgs) -> Result<()> {
    let inputs = if args.inputs.is_empty() {
        vec![PathBuf::from("-")]
    } else {
        args.inputs.clone()
    };
    let config = DedupeConfig {
        ignore: match &args.ignore_fields {
            Some(list) => parse_field_list(list)?,
            None => Vec::new(),
        },
        packets_delta: args.packets_delta,
        bytes_delta: args.bytes_delta,
        stime_delta_ms: args.stime_delta,
        duration_delta_ms: args.duration_delta,
    };
    let deduper = Deduper::new(&config)?;
    let spool = TempSpool::new(args.temp.temp_directory.as_deref(), "flowkit-dedupe-")?;
    let sorter_config = SorterConfig {
        buffer_size: args.buffer.buffer_size,
        merge_fanin: DEFAULT_MERGE_FANIN,
    };
    let mut sorter = ExternalSorter::new(deduper.extractor(), &sorter_config, spool)?;

    let mut input_metadata = Metadata::default();
    let mut pl = ProgressLogger::default();
    pl.item_name("records");
    if let Some(duration) = global_args.log_interval {
        pl.log_interval(duration);
    }
    pl.start("Reading records...");
    for input in &inputs {
        let mut reader = RecordReader::open(input)?.with_policy(args.policy.ipv6_policy);
        input_metadata.merge(reader.metadata());
        while let Some(rec) = reader.read_record()? {
            shutdown::check()?;
            sorter.push(&rec)?;
            pl.update();
        }
    }
    pl.done();

    let metadata = args.output.metadata(input_metadata);
    let mut sink = RecordWriter::create(&args.output.output_path, &metadata)?;
    let (read, written) = deduper.run(sorter.finish_stream()?, &mut sink)?;
    sink.finish()?;
    log::info!("Kept {} of {} records", written, read);
    Ok(())
}
