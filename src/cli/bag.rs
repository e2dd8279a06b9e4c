/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{GlobalArgs, Ipv6PolicyArg, MetadataArgs};
use crate::bag::pipeline::{BagPipeline, BagRequest};
use crate::io::{Metadata, RecordReader};
use crate::pmap::PrefixMap;
use crate::shutdown;
use anyhow::{Context, Result};
use clap::Parser;
use dsi_progress_logger::prelude::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Aggregate flow records into key/counter bags, one pass for any number of bags.")]
pub struct CliArgs {
    /// Input corpora; `-` is standard input.
    pub inputs: Vec<PathBuf>,

    #[arg(long, short = 'b', required = true)]
    /// A bag to build, as KEY,COUNTER,PATH: the key is a record field
    /// (e.g. `sip`, `proto`), a country lookup (`sip-country`), or a
    /// prefix-map lookup (`sip-pmap[:MAPNAME]`); the counter is
    /// `records`, `sum-packets`, or `sum-bytes`. Repeatable; at most one
    /// PATH may be `-`.
    pub bag_file: Vec<String>,

    #[arg(long)]
    /// Load a prefix map; repeatable. The map name comes from the file
    /// unless given as NAME:PATH.
    pub pmap_file: Vec<String>,

    #[arg(long)]
    /// Load the country-code prefix map used by the `*-country` keys.
    pub country_file: Option<PathBuf>,

    #[clap(flatten)]
    pub policy: Ipv6PolicyArg,

    #[clap(flatten)]
    pub meta: MetadataArgs,
}

/// Loads a `--pmap-file` argument, honoring an optional NAME: override.
fn load_pmap(arg: &str) -> Result<PrefixMap> {
    match arg.split_once(':') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok(PrefixMap::load(path)?.with_name(name))
        }
        _ => PrefixMap::load(arg),
    }
}

pub fn main(global_args: GlobalArgs, args: CliArgs) -> Result<()> {
    let inputs = if args.inputs.is_empty() {
        vec![PathBuf::from("-")]
    } else {
        args.inputs.clone()
    };
    let requests = args
        .bag_file
        .iter()
        .map(|text| BagRequest::parse(text))
        .collect::<Result<Vec<_>>>()?;
    let pmaps = args
        .pmap_file
        .iter()
        .map(|arg| load_pmap(arg))
        .collect::<Result<Vec<_>>>()?;
    let country = args
        .country_file
        .as_ref()
        .map(|path| PrefixMap::load(path).context("Could not load the country map"))
        .transpose()?;
    let mut pipeline = BagPipeline::new(requests, pmaps, country)?;

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
            pipeline.process(&rec)?;
            pl.update();
        }
    }
    pl.done();

    let metadata = args.meta.metadata(input_metadata);
    pipeline.finish(&metadata)
}
