/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{
    collect_input_metadata, BufferSizeArg, GlobalArgs, Ipv6PolicyArg, OutputArgs, TempDirArg,
};
use crate::fields::KeyExtractor;
use crate::io::{Metadata, RecordReader, RecordWriter};
use crate::shutdown;
use crate::sorter::{ExternalSorter, SorterConfig, DEFAULT_MERGE_FANIN};
use crate::spool::TempSpool;
use anyhow::Result;
use clap::Parser;
use dsi_progress_logger::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(about = "Sort flow records by an arbitrary multi-field key.", long_about = None)]
pub struct CliArgs {
    /// Input corpora; `-` is standard input.
    pub inputs: Vec<PathBuf>,

    #[arg(long, short = 'f')]
    /// Comma-separated fields forming the sort key, e.g. `sip,dip,stime`.
    pub fields: String,

    #[arg(long)]
    /// Assert that every input is already sorted by the key; the inputs
    /// are then merged without resorting.
    pub presorted_input: bool,

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
    let extractor = Arc::new(KeyExtractor::from_field_list(&args.fields)?);
    let spool = TempSpool::new(args.temp.temp_directory.as_deref(), "flowkit-sort-")?;
    let config = SorterConfig {
        buffer_size: args.buffer.buffer_size,
        merge_fanin: DEFAULT_MERGE_FANIN,
    };
    let sorter = ExternalSorter::new(extractor, &config, spool)?;

    let written = if args.presorted_input {
        let metadata = args.output.metadata(collect_input_metadata(&inputs)?);
        let mut sink = RecordWriter::create(&args.output.output_path, &metadata)?;
        sorter.merge_presorted(inputs, args.policy.ipv6_policy, &mut sink)?;
        sink.finish()?
    } else {
        let mut sorter = sorter;
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
        sorter.finish(&mut sink)?;
        sink.finish()?
    };
    log::info!("Wrote {} records", written);
    Ok(())
}
