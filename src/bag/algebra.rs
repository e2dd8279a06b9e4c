/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Set-like operations over streams of bags.
//!
//! Every operation reads its first input into memory (the accumulator) and
//! consumes each further input as a stream in key order, mutating the
//! accumulator. Post-processing applies, in this order: key/counter/IP-set
//! cutoffs, inversion, and cover-set extraction.

use super::{Bag, BagReader, KeyType, SubStatus};
use crate::flow::u128_is_v4;
use crate::ipset::IpSet;
use anyhow::{bail, ensure, Result};
use std::collections::BTreeMap;

/// Predicate for [`compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CompareOp {
    fn eval(self, a: u64, b: u64) -> bool {
        match self {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Eq => a == b,
            CompareOp::Ge => a >= b,
            CompareOp::Gt => a > b,
        }
    }
}

/// Widens the accumulator's key type to cover the incoming stream.
fn unify(acc: &mut Bag, reader: &BagReader) -> Result<()> {
    acc.promote(reader.key_type())
}

/// `acc[k] += in[k]`, saturating.
pub fn add(acc: &mut Bag, reader: &mut BagReader) -> Result<()> {
    unify(acc, reader)?;
    while let Some((key, counter)) = reader.next_entry()? {
        let _ = acc.insert_or_add(key, counter);
    }
    Ok(())
}

/// `acc[k] -= in[k]`; keys that reach or cross zero are removed, and keys
/// present only in the input are ignored.
pub fn subtract(acc: &mut Bag, reader: &mut BagReader) -> Result<()> {
    unify(acc, reader)?;
    while let Some((key, counter)) = reader.next_entry()? {
        if acc.get(key) == 0 {
            continue;
        }
        if let SubStatus::Underflow = acc.insert_or_subtract(key, counter) {
            // Removal is the defined behavior; worth a note, not an error.
            log::info!("Subtraction underflow on a key; key removed");
        }
    }
    Ok(())
}

/// Multiset intersection: `acc[k] := min(acc[k], in[k])`, where an absent
/// input key counts as zero and therefore removes `k`.
pub fn minimize(acc: &mut Bag, reader: &mut BagReader) -> Result<()> {
    unify(acc, reader)?;
    let mut result = BTreeMap::new();
    let mut entry = reader.next_entry()?;
    for (key, counter) in acc.iter() {
        // Skip input keys below the accumulator's cursor.
        while let Some((in_key, _)) = entry {
            if in_key >= key {
                break;
            }
            entry = reader.next_entry()?;
        }
        if let Some((in_key, in_counter)) = entry {
            if in_key == key && in_counter > 0 {
                result.insert(key, counter.min(in_counter));
            }
        }
    }
    acc.replace_entries(result);
    Ok(())
}

/// Multiset union: `acc[k] := max(acc[k], in[k])`.
pub fn maximize(acc: &mut Bag, reader: &mut BagReader) -> Result<()> {
    unify(acc, reader)?;
    while let Some((key, counter)) = reader.next_entry()? {
        if counter > acc.get(key) {
            acc.set(key, counter);
        }
    }
    Ok(())
}

/// `acc[k] := round(acc[k] / in[k])`, round half up. A dividend key with
/// no divisor is fatal; divisor keys with no dividend are ignored.
pub fn divide(acc: &mut Bag, reader: &mut BagReader) -> Result<()> {
    unify(acc, reader)?;
    let mut result = BTreeMap::new();
    let mut entry = reader.next_entry()?;
    for (key, counter) in acc.iter() {
        while let Some((in_key, _)) = entry {
            if in_key >= key {
                break;
            }
            entry = reader.next_entry()?;
        }
        match entry {
            Some((in_key, in_counter)) if in_key == key && in_counter > 0 => {
                let quotient = round_half_up(counter, in_counter);
                if quotient > 0 {
                    result.insert(key, quotient);
                }
            }
            _ => bail!("Division by zero: divisor bag has no entry for a dividend key"),
        }
    }
    acc.replace_entries(result);
    Ok(())
}

/// Integer division rounding half upward.
fn round_half_up(a: u64, b: u64) -> u64 {
    (a / b) + ((a % b) >= (b / 2 + (b & 1))) as u64
}

/// Keeps the keys whose counters satisfy `acc[k] OP in[k]`, setting their
/// counter to 1; every other accumulator key is removed.
pub fn compare(acc: &mut Bag, reader: &mut BagReader, op: CompareOp) -> Result<()> {
    unify(acc, reader)?;
    let mut result = BTreeMap::new();
    let mut entry = reader.next_entry()?;
    for (key, counter) in acc.iter() {
        while let Some((in_key, _)) = entry {
            if in_key >= key {
                break;
            }
            entry = reader.next_entry()?;
        }
        if let Some((in_key, in_counter)) = entry {
            if in_key == key && op.eval(counter, in_counter) {
                result.insert(key, 1);
            }
        }
    }
    acc.replace_entries(result);
    Ok(())
}

/// `acc[k] *= scalar`, saturating with a single log line.
pub fn scalar_multiply(acc: &mut Bag, scalar: u64) {
    let mut saturated = false;
    let mut result = BTreeMap::new();
    for (key, counter) in acc.iter() {
        let product = match counter.checked_mul(scalar) {
            Some(product) => product,
            None => {
                saturated = true;
                u64::MAX
            }
        };
        if product > 0 {
            result.insert(key, product);
        }
    }
    if saturated {
        log::warn!("Scalar multiplication overflowed; counters saturated");
        acc.set_overflowed();
    }
    acc.replace_entries(result);
}

/// Key and counter windows plus an optional IP-set mask, applied after the
/// operation.
#[derive(Debug, Clone, Default)]
pub struct Cutoffs {
    pub min_key: Option<u128>,
    pub max_key: Option<u128>,
    pub min_counter: Option<u64>,
    pub max_counter: Option<u64>,
    pub intersect: Option<IpSet>,
    /// Keep the keys *not* in the intersect set.
    pub complement: bool,
}

impl Cutoffs {
    pub fn is_noop(&self) -> bool {
        self.min_key.is_none()
            && self.max_key.is_none()
            && self.min_counter.is_none()
            && self.max_counter.is_none()
            && self.intersect.is_none()
    }

    pub fn apply(&self, acc: &mut Bag) {
        if self.is_noop() {
            return;
        }
        acc.retain(|key, counter| {
            self.min_key.is_none_or(|min| key >= min)
                && self.max_key.is_none_or(|max| key <= max)
                && self.min_counter.is_none_or(|min| counter >= min)
                && self.max_counter.is_none_or(|max| counter <= max)
                && self
                    .intersect
                    .as_ref()
                    .is_none_or(|set| set.contains_bits(key) != self.complement)
        });
    }
}

/// Rewrites the bag so that each distinct counter value becomes a key
/// whose counter is the number of original keys that had it. Counters at
/// or above `u32::MAX` land in the `u32::MAX` bucket.
pub fn invert(acc: &Bag) -> Bag {
    let mut inverted = Bag::new(KeyType::U64);
    for (_, counter) in acc.iter() {
        let bucket = counter.min(u32::MAX as u64);
        let _ = inverted.insert_or_add(bucket as u128, 1);
    }
    inverted
}

/// The bag's keys as an IP set. Only meaningful for IP-keyed bags.
pub fn cover_set(acc: &Bag) -> Result<IpSet> {
    ensure!(
        acc.key_type().is_ip() || acc.iter().all(|(key, _)| u128_is_v4(key)),
        "Cover set requires an IP-keyed bag"
    );
    let mut set = IpSet::new();
    for (key, _) in acc.iter() {
        set.insert_bits(key);
    }
    Ok(set)
}
