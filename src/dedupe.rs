/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Near-duplicate elimination over an external sort.
//!
//! The deduplication key is every stored record field minus the
//! user-ignored ones, with the *delta fields* (packets, bytes, start time,
//! duration — those given a nonzero tolerance) moved to the end of the key
//! so that near-equal records come out of the sort adjacent while the
//! exact-equality prefix keeps its ordering. The sorted stream is then
//! scanned: a record matches the previous one iff the exact prefix is
//! byte-equal and every delta field is within its window, and only the
//! first record of each match-run is emitted.

use crate::fields::{FieldKind, KeyExtractor};
use crate::io::{RecordWriter, RECORD_SIZE};
use crate::sorter::SortedNodes;
use anyhow::{ensure, Result};
use std::sync::Arc;

/// Tolerance windows; a zero keeps the field in the exact-equality prefix.
#[derive(Debug, Clone, Default)]
pub struct DedupeConfig {
    /// Fields excluded from the comparison entirely.
    pub ignore: Vec<FieldKind>,
    pub packets_delta: u32,
    pub bytes_delta: u32,
    pub stime_delta_ms: u64,
    pub duration_delta_ms: u32,
}

/// The delta-capable fields, in the order they are appended to the key.
const DELTA_ORDER: [FieldKind; 4] = [
    FieldKind::Packets,
    FieldKind::Bytes,
    FieldKind::StimeMs,
    FieldKind::DurMs,
];

struct Delta {
    kind: FieldKind,
    tolerance: u64,
}

pub struct Deduper {
    extractor: Arc<KeyExtractor>,
    /// Width of the exact-equality key prefix.
    exact_width: usize,
    deltas: Vec<Delta>,
}

impl Deduper {
    pub fn new(config: &DedupeConfig) -> Result<Self> {
        let tolerance = |kind: FieldKind| match kind {
            FieldKind::Packets => config.packets_delta as u64,
            FieldKind::Bytes => config.bytes_delta as u64,
            FieldKind::StimeMs => config.stime_delta_ms,
            FieldKind::DurMs => config.duration_delta_ms as u64,
            _ => 0,
        };
        let deltas: Vec<Delta> = DELTA_ORDER
            .into_iter()
            .filter(|kind| !config.ignore.contains(kind) && tolerance(*kind) > 0)
            .map(|kind| Delta {
                kind,
                tolerance: tolerance(kind),
            })
            .collect();
        let exact: Vec<FieldKind> = FieldKind::STORED
            .into_iter()
            .filter(|kind| {
                !config.ignore.contains(kind) && !deltas.iter().any(|delta| delta.kind == *kind)
            })
            .collect();
        ensure!(
            !exact.is_empty() || !deltas.is_empty(),
            "Every field is ignored; nothing to compare"
        );
        let exact_width = exact.iter().map(|kind| kind.width()).sum();
        let key_fields = exact
            .into_iter()
            .chain(deltas.iter().map(|delta| delta.kind));
        Ok(Deduper {
            extractor: Arc::new(KeyExtractor::from_kinds(key_fields)),
            exact_width,
            deltas,
        })
    }

    /// The extractor to sort with; delta fields sit at the end of the key.
    pub fn extractor(&self) -> Arc<KeyExtractor> {
        self.extractor.clone()
    }

    /// Whether `node` duplicates `prev` (exact prefix byte-equal, every
    /// delta field within its window).
    fn matches(&self, prev: &[u8], node: &[u8]) -> bool {
        let prev_key = &prev[RECORD_SIZE..];
        let key = &node[RECORD_SIZE..];
        if prev_key[..self.exact_width] != key[..self.exact_width] {
            return false;
        }
        let mut offset = self.exact_width;
        for delta in &self.deltas {
            let width = delta.kind.width();
            let a = read_be(&prev_key[offset..offset + width]);
            let b = read_be(&key[offset..offset + width]);
            if a.abs_diff(b) > delta.tolerance {
                return false;
            }
            offset += width;
        }
        true
    }

    /// Scans the sorted stream, writing the first record of each match-run
    /// to `sink` and dropping the rest. Returns `(read, written)` counts.
    pub fn run(&self, mut stream: SortedNodes, sink: &mut RecordWriter) -> Result<(u64, u64)> {
        let mut read = 0;
        let mut written = 0;
        let mut prev: Option<Vec<u8>> = None;
        while let Some(node) = stream.next_node()? {
            read += 1;
            let duplicate = prev.as_deref().is_some_and(|prev| self.matches(prev, &node));
            if !duplicate {
                sink.write_raw(node[..RECORD_SIZE].try_into().unwrap())?;
                written += 1;
            }
            // Matching is against the previous record in sorted order, not
            // against the representative of the run.
            prev = Some(node);
        }
        Ok((read, written))
    }
}

fn read_be(slice: &[u8]) -> u64 {
    slice.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}
