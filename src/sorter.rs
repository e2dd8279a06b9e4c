/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! External merge-sort of flow records under a memory budget.
//!
//! An [`ExternalSorter`] ingests records into a flat in-memory buffer of
//! *sort nodes* (the serialized record followed by its key bytes), sorts
//! and spills the buffer to a [`TempSpool`] run whenever it reaches the
//! budgeted capacity, and finally merges the runs with a [quaternary
//! heap](dary_heap::QuaternaryHeap). The merge fan-in is bounded by a
//! configured cap and by whatever the process can actually open: a run
//! that fails to open with a resource-exhaustion error is deferred to a
//! later pass, whose input is the tempfile produced by the current one.
//!
//! Keys are kept alongside the records in the runs, so the merge phase
//! never recomputes them; plug-in key bytes in particular are not
//! derivable from the record alone. [`ExternalSorter::finish_stream`]
//! returns the merged nodes as a pull stream (the deduplicator consumes
//! keys and records together); [`ExternalSorter::finish`] drains it into a
//! record sink.

use crate::fields::KeyExtractor;
use crate::flow::FlowRecord;
use crate::io::{encode_record, IpPolicy, RecordReader, RecordWriter, RECORD_SIZE};
use crate::shutdown;
use crate::spool::{chain_is_resource_exhaustion, TempSpool};
use anyhow::{bail, ensure, Context, Result};
use dary_heap::{PeekMut, QuaternaryHeap};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Default in-memory budget, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 64 << 20;
/// Default cap on the number of runs merged in one pass.
pub const DEFAULT_MERGE_FANIN: usize = 1024;
/// Growth factor: the initial allocation is 1/4 of the budget.
const GROWTH: usize = 4;
/// Fewer buffered records than this is not worth running with.
const MIN_NODES: usize = 4096;
/// How often the merge loop polls the shutdown flag.
const SHUTDOWN_STRIDE: usize = 4096;

#[derive(Debug, Clone)]
pub struct SorterConfig {
    /// Total memory budget for the node buffer, in bytes.
    pub buffer_size: usize,
    /// Cap on the merge fan-in; the effective fan-in may be smaller when
    /// the process runs out of file descriptors.
    pub merge_fanin: usize,
}

impl Default for SorterConfig {
    fn default() -> Self {
        SorterConfig {
            buffer_size: DEFAULT_BUFFER_SIZE,
            merge_fanin: DEFAULT_MERGE_FANIN,
        }
    }
}

/// A run waiting to be merged: an input asserted sorted by the caller, or
/// a spilled tempfile.
enum Pending {
    Input(PathBuf),
    Spill(usize),
}

pub struct ExternalSorter {
    extractor: Arc<KeyExtractor>,
    spool: TempSpool,
    node_size: usize,
    /// Hard cap on buffered nodes, from the memory budget; lowered to the
    /// current capacity if a growth allocation fails.
    max_nodes: usize,
    /// Nodes added per growth step.
    chunk_nodes: usize,
    /// Currently allocated capacity, in nodes.
    capacity_nodes: usize,
    buffer: Vec<u8>,
    runs: Vec<usize>,
    merge_fanin: usize,
}

impl ExternalSorter {
    pub fn new(
        extractor: Arc<KeyExtractor>,
        config: &SorterConfig,
        spool: TempSpool,
    ) -> Result<Self> {
        ensure!(config.merge_fanin >= 2, "Merge fan-in must be at least 2");
        let node_size = RECORD_SIZE + extractor.width();
        let max_nodes = (config.buffer_size / node_size).max(2);
        let initial = (max_nodes / GROWTH).max(1);
        let floor = MIN_NODES.min(initial);
        let mut chunk_nodes = initial;
        let mut buffer = Vec::new();
        // Halve the initial request on allocation failure, down to a floor
        // below which sorting is hopeless.
        while buffer.try_reserve_exact(chunk_nodes * node_size).is_err() {
            chunk_nodes /= 2;
            if chunk_nodes < floor {
                bail!(
                    "Could not allocate a sort buffer of at least {} records",
                    floor
                );
            }
        }
        Ok(ExternalSorter {
            extractor,
            spool,
            node_size,
            max_nodes,
            chunk_nodes,
            capacity_nodes: chunk_nodes,
            buffer,
            runs: Vec::new(),
            merge_fanin: config.merge_fanin,
        })
    }

    fn buffered_nodes(&self) -> usize {
        self.buffer.len() / self.node_size
    }

    /// Adds a record to the buffer, spilling a sorted run when the buffer
    /// is at the budgeted maximum.
    pub fn push(&mut self, rec: &FlowRecord) -> Result<()> {
        if self.buffered_nodes() == self.capacity_nodes {
            if self.capacity_nodes < self.max_nodes {
                let want = self.chunk_nodes.min(self.max_nodes - self.capacity_nodes);
                if self.buffer.try_reserve_exact(want * self.node_size).is_ok() {
                    self.capacity_nodes += want;
                } else {
                    // Treat the current capacity as the maximum from now on.
                    log::warn!(
                        "Could not grow the sort buffer; continuing with {} records per run",
                        self.capacity_nodes
                    );
                    self.max_nodes = self.capacity_nodes;
                    self.spill()?;
                }
            } else {
                self.spill()?;
            }
        }
        let start = self.buffer.len();
        self.buffer.resize(start + self.node_size, 0);
        let node = &mut self.buffer[start..];
        encode_record(rec, (&mut node[..RECORD_SIZE]).try_into().unwrap());
        self.extractor.write_key(rec, &mut node[RECORD_SIZE..])?;
        Ok(())
    }

    /// Sorted node order of the current buffer.
    fn sorted_order(&self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.buffered_nodes() as u32).collect();
        order.sort_unstable_by(|&a, &b| {
            self.extractor
                .compare(self.key_of(a as usize), self.key_of(b as usize))
        });
        order
    }

    fn node_of(&self, index: usize) -> &[u8] {
        &self.buffer[index * self.node_size..(index + 1) * self.node_size]
    }

    fn key_of(&self, index: usize) -> &[u8] {
        &self.node_of(index)[RECORD_SIZE..]
    }

    /// Sorts the buffer in place and writes it out as a new run.
    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let order = self.sorted_order();
        let (index, mut writer) = self.spool.create()?;
        for node in order {
            writer.write_all(self.node_of(node as usize))?;
        }
        // A failed close of a write stream loses data and is fatal.
        writer
            .flush()
            .context("Could not flush a temporary sort run")?;
        log::debug!(
            "Spilled run {} with {} records",
            index,
            self.buffered_nodes()
        );
        self.runs.push(index);
        self.buffer.clear();
        Ok(())
    }

    /// Sorts whatever is buffered and returns the fully sorted node
    /// stream. When nothing was spilled the buffer is streamed directly;
    /// otherwise the remainder becomes the final run and the runs are
    /// merged.
    pub fn finish_stream(mut self) -> Result<SortedNodes> {
        if self.runs.is_empty() {
            let order = self.sorted_order();
            return Ok(SortedNodes {
                inner: SortedNodesInner::Buffer {
                    buffer: self.buffer,
                    order: order.into_iter(),
                    node_size: self.node_size,
                },
                _spool: self.spool,
            });
        }
        self.spill()?;
        let pending = self.runs.drain(..).map(Pending::Spill).collect();
        self.into_merge_stream(pending, IpPolicy::Mix)
    }

    /// Sorts whatever is buffered and streams the sorted output to `sink`.
    pub fn finish(self, sink: &mut RecordWriter) -> Result<()> {
        self.finish_stream()?.drain_to(sink)
    }

    /// Merges inputs that the caller asserts are already sorted by the
    /// configured key, without resorting them.
    pub fn merge_presorted_stream(
        self,
        inputs: impl IntoIterator<Item = PathBuf>,
        policy: IpPolicy,
    ) -> Result<SortedNodes> {
        ensure!(
            self.buffer.is_empty() && self.runs.is_empty(),
            "Presorted merge cannot follow pushed records"
        );
        let pending = inputs.into_iter().map(Pending::Input).collect();
        self.into_merge_stream(pending, policy)
    }

    /// [`merge_presorted_stream`](Self::merge_presorted_stream), drained
    /// to `sink`.
    pub fn merge_presorted(
        self,
        inputs: impl IntoIterator<Item = PathBuf>,
        policy: IpPolicy,
        sink: &mut RecordWriter,
    ) -> Result<()> {
        self.merge_presorted_stream(inputs, policy)?.drain_to(sink)
    }

    /// Runs intermediate merge passes until the remaining runs fit in one
    /// fan-in, then returns the final merge as a stream. A pass that
    /// cannot cover all remaining runs writes a new run, which joins the
    /// pending list.
    fn into_merge_stream(
        mut self,
        mut pending: VecDeque<Pending>,
        policy: IpPolicy,
    ) -> Result<SortedNodes> {
        loop {
            let want = pending.len().min(self.merge_fanin);
            let mut sources = Vec::with_capacity(want);
            while sources.len() < want {
                match self.open_source(&pending[sources.len()], policy) {
                    Ok(source) => sources.push(source),
                    // With at least two runs open the merge can still make
                    // progress; leave the rest to a later pass.
                    Err(err) if sources.len() >= 2 && chain_is_resource_exhaustion(&err) => {
                        log::warn!(
                            "Merging only {} of {} runs per pass: {}",
                            sources.len(),
                            pending.len(),
                            err
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            let consumed: Vec<Pending> = pending.drain(..sources.len()).collect();
            let mut merger = KMerge::new(sources, self.extractor.clone())?;
            if pending.is_empty() {
                // The final pass: hand the merge to the caller. The runs
                // it still reads are unlinked with the spool.
                return Ok(SortedNodes {
                    inner: SortedNodesInner::Merge(merger),
                    _spool: self.spool,
                });
            }
            let (index, mut writer) = self.spool.create()?;
            while let Some(node) = merger.next()? {
                writer.write_all(&node)?;
            }
            writer
                .flush()
                .context("Could not flush a temporary merge run")?;
            pending.push_back(Pending::Spill(index));
            for run in consumed {
                if let Pending::Spill(index) = run {
                    self.spool.remove(index)?;
                }
            }
        }
    }

    fn open_source(&self, run: &Pending, policy: IpPolicy) -> Result<RunSource> {
        match run {
            Pending::Input(path) => Ok(RunSource::Stream {
                reader: RecordReader::open(path)?.with_policy(policy),
                extractor: self.extractor.clone(),
                node_size: self.node_size,
            }),
            Pending::Spill(index) => {
                let file = self.spool.reopen(*index).map_err(|err| {
                    anyhow::Error::new(err).context(format!("Could not reopen sort run {}", index))
                })?;
                Ok(RunSource::Spill {
                    reader: BufReader::with_capacity(1 << 16, file),
                    node_size: self.node_size,
                    index: *index,
                })
            }
        }
    }
}

/// The fully sorted output of an [`ExternalSorter`], as a pull stream of
/// nodes (serialized record followed by key bytes). Owns the spool, so the
/// backing tempfiles survive exactly as long as the stream.
pub struct SortedNodes {
    inner: SortedNodesInner,
    _spool: TempSpool,
}

enum SortedNodesInner {
    Buffer {
        buffer: Vec<u8>,
        order: std::vec::IntoIter<u32>,
        node_size: usize,
    },
    Merge(KMerge),
}

impl SortedNodes {
    /// The next node in key order; `None` at the end.
    pub fn next_node(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.inner {
            SortedNodesInner::Buffer {
                buffer,
                order,
                node_size,
            } => Ok(order.next().map(|index| {
                buffer[index as usize * *node_size..(index as usize + 1) * *node_size].to_vec()
            })),
            SortedNodesInner::Merge(merger) => merger.next(),
        }
    }

    /// Writes every remaining record to `sink`, dropping the key bytes.
    pub fn drain_to(mut self, sink: &mut RecordWriter) -> Result<()> {
        while let Some(node) = self.next_node()? {
            sink.write_raw(node[..RECORD_SIZE].try_into().unwrap())?;
        }
        Ok(())
    }
}

/// A single sorted run being merged.
enum RunSource {
    Spill {
        reader: BufReader<File>,
        node_size: usize,
        index: usize,
    },
    Stream {
        reader: RecordReader,
        extractor: Arc<KeyExtractor>,
        node_size: usize,
    },
}

impl RunSource {
    fn next_node(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            RunSource::Spill {
                reader,
                node_size,
                index,
            } => {
                let mut node = vec![0u8; *node_size];
                let mut filled = 0;
                while filled < *node_size {
                    let n = reader
                        .read(&mut node[filled..])
                        .with_context(|| format!("Read error in sort run {}", index))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                match filled {
                    0 => Ok(None),
                    n if n == *node_size => Ok(Some(node)),
                    _ => bail!("Truncated sort run {}", index),
                }
            }
            RunSource::Stream {
                reader,
                extractor,
                node_size,
            } => match reader.read_record()? {
                None => Ok(None),
                Some(rec) => {
                    let mut node = vec![0u8; *node_size];
                    encode_record(&rec, (&mut node[..RECORD_SIZE]).try_into().unwrap());
                    extractor.write_key(&rec, &mut node[RECORD_SIZE..])?;
                    Ok(Some(node))
                }
            },
        }
    }
}

/// A run head plus the rest of its source. The ordering is reversed so a
/// max-heap of `HeadTail`s pops the smallest key, and delegates to the key
/// extractor so plug-in comparators are honored.
struct HeadTail {
    node: Vec<u8>,
    source: RunSource,
    extractor: Arc<KeyExtractor>,
}

impl HeadTail {
    fn key(&self) -> &[u8] {
        &self.node[RECORD_SIZE..]
    }
}

impl PartialEq for HeadTail {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeadTail {}

impl PartialOrd for HeadTail {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadTail {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.extractor.compare(other.key(), self.key())
    }
}

/// Merges sorted runs with a quaternary heap of their heads.
struct KMerge {
    heap: QuaternaryHeap<HeadTail>,
    since_poll: usize,
}

impl KMerge {
    fn new(sources: Vec<RunSource>, extractor: Arc<KeyExtractor>) -> Result<Self> {
        let mut heap = QuaternaryHeap::with_capacity(sources.len());
        for mut source in sources {
            if let Some(node) = source.next_node()? {
                heap.push(HeadTail {
                    node,
                    source,
                    extractor: extractor.clone(),
                });
            }
        }
        Ok(KMerge {
            heap,
            since_poll: 0,
        })
    }

    fn next(&mut self) -> Result<Option<Vec<u8>>> {
        self.since_poll += 1;
        if self.since_poll >= SHUTDOWN_STRIDE {
            self.since_poll = 0;
            shutdown::check()?;
        }
        let Some(mut head_tail) = self.heap.peek_mut() else {
            return Ok(None);
        };
        match head_tail.source.next_node()? {
            None => Ok(Some(PeekMut::pop(head_tail).node)),
            Some(node) => Ok(Some(std::mem::replace(&mut head_tail.node, node))),
        }
    }
}
