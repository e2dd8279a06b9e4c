/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{GlobalArgs, OutputArgs};
use crate::bag::algebra::{self, CompareOp, Cutoffs};
use crate::bag::{Bag, BagReader};
use crate::ipset::IpSet;
use anyhow::{bail, ensure, Result};
use clap::{ArgGroup, Parser};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    about = "Combine bags with set-like operations and filter, invert, or project the result.",
    group = ArgGroup::new("operation").args([
        "add",
        "subtract",
        "minimize",
        "maximize",
        "divide",
        "compare",
        "scalar_multiply",
    ])
)]
pub struct CliArgs {
    /// Input bags; the first is the accumulator, every other one streams
    /// into it.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    #[arg(long)]
    /// Add counters key by key (the default operation).
    pub add: bool,

    #[arg(long)]
    /// Subtract counters key by key; keys reaching zero disappear.
    pub subtract: bool,

    #[arg(long)]
    /// Keep the key-wise minimum (multiset intersection).
    pub minimize: bool,

    #[arg(long)]
    /// Keep the key-wise maximum (multiset union).
    pub maximize: bool,

    #[arg(long)]
    /// Divide the first bag by the second, rounding half up.
    pub divide: bool,

    #[arg(long, value_enum)]
    /// Keep the keys whose first-bag counter satisfies the predicate
    /// against the second bag, with counter 1.
    pub compare: Option<CompareOp>,

    #[arg(long)]
    /// Multiply every counter by a scalar, saturating.
    pub scalar_multiply: Option<u64>,

    #[arg(long, value_parser = key_bound_parser)]
    /// Drop keys below this bound (an integer or an IP address).
    pub minkey: Option<u128>,

    #[arg(long, value_parser = key_bound_parser)]
    /// Drop keys above this bound (an integer or an IP address).
    pub maxkey: Option<u128>,

    #[arg(long)]
    /// Drop entries with a counter below this value.
    pub mincounter: Option<u64>,

    #[arg(long)]
    /// Drop entries with a counter above this value.
    pub maxcounter: Option<u64>,

    #[arg(long, conflicts_with = "complement_intersect")]
    /// Keep only keys that are members of this IP set.
    pub intersect: Option<PathBuf>,

    #[arg(long)]
    /// Keep only keys that are not members of this IP set.
    pub complement_intersect: Option<PathBuf>,

    #[arg(long, conflicts_with = "coverset")]
    /// Replace the bag by its counter histogram: each distinct counter
    /// value becomes a key counting how many keys had it.
    pub invert: bool,

    #[arg(long)]
    /// Write the keys as an IP set instead of writing a bag.
    pub coverset: bool,

    #[clap(flatten)]
    pub output: OutputArgs,
}

/// Parses a key bound: a decimal integer or an IP address (normalized to
/// the 16-byte key space).
pub fn key_bound_parser(arg: &str) -> Result<u128> {
    if let Ok(value) = arg.parse::<u128>() {
        return Ok(value);
    }
    match arg.parse::<IpAddr>() {
        Ok(addr) => Ok(crate::flow::ip_to_u128(addr)),
        Err(_) => bail!("{:?} is neither an integer nor an IP address", arg),
    }
}

pub fn main(_global_args: GlobalArgs, args: CliArgs) -> Result<()> {
    let two_input_op = args.divide || args.compare.is_some();
    if two_input_op {
        ensure!(
            args.inputs.len() == 2,
            "This operation takes exactly two input bags"
        );
    }
    if args.scalar_multiply.is_some() {
        ensure!(
            args.inputs.len() == 1,
            "--scalar-multiply takes exactly one input bag"
        );
    }

    let (mut acc, mut metadata) = Bag::read(&args.inputs[0])?;
    for input in &args.inputs[1..] {
        let mut reader = BagReader::open(input)?;
        metadata.merge(reader.metadata());
        if args.subtract {
            algebra::subtract(&mut acc, &mut reader)?;
        } else if args.minimize {
            algebra::minimize(&mut acc, &mut reader)?;
        } else if args.maximize {
            algebra::maximize(&mut acc, &mut reader)?;
        } else if args.divide {
            algebra::divide(&mut acc, &mut reader)?;
        } else if let Some(op) = args.compare {
            algebra::compare(&mut acc, &mut reader, op)?;
        } else {
            algebra::add(&mut acc, &mut reader)?;
        }
    }
    if let Some(scalar) = args.scalar_multiply {
        algebra::scalar_multiply(&mut acc, scalar);
    }

    let intersect = match (&args.intersect, &args.complement_intersect) {
        (Some(path), _) | (_, Some(path)) => Some(IpSet::read(path)?.0),
        _ => None,
    };
    Cutoffs {
        min_key: args.minkey,
        max_key: args.maxkey,
        min_counter: args.mincounter,
        max_counter: args.maxcounter,
        complement: args.complement_intersect.is_some(),
        intersect,
    }
    .apply(&mut acc);

    let metadata = args.output.metadata(metadata);
    if args.coverset {
        let set = algebra::cover_set(&acc)?;
        set.write(&args.output.output_path, &metadata)?;
        log::info!("Wrote a cover set of {} addresses", set.count());
        return Ok(());
    }
    let result = if args.invert { algebra::invert(&acc) } else { acc };
    if result.overflowed() {
        log::warn!("The output bag carries saturated counters");
    }
    result.write(&args.output.output_path, &metadata)?;
    log::info!("Wrote a bag of {} keys", result.len());
    Ok(())
}
