/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Prefix maps: user-loaded functions from an IP address, or from a
//! (protocol, port) pair, to a 32-bit value.
//!
//! Maps are loaded from the textual source format:
//!
//! ```text
//! map-name  internal
//! mode      ip
//! 10.0.0.0/8      1
//! 10.1.0.0/16     2      # longest prefix wins
//! 2001:db8::/32   3
//! ```
//!
//! or, for protocol/port maps:
//!
//! ```text
//! mode proto-port
//! 6/80          1
//! 6/8000-8080   2
//! 17/53         3
//! ```
//!
//! At load time the entries are painted, most-general first, into disjoint
//! intervals, so lookups are a binary search and longest-prefix semantics
//! cost nothing per query.

use crate::flow::ip_to_u128;
use anyhow::{bail, ensure, Context, Result};
use std::net::IpAddr;
use std::path::Path;

/// What the map's keys are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapContent {
    Ipv4,
    Ipv6,
    ProtoPort,
}

impl PmapContent {
    pub fn is_ip(self) -> bool {
        matches!(self, PmapContent::Ipv4 | PmapContent::Ipv6)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    lo: u128,
    hi: u128,
    value: u32,
}

/// A compiled prefix map.
#[derive(Debug, Clone)]
pub struct PrefixMap {
    name: String,
    content: PmapContent,
    /// Sorted disjoint intervals.
    entries: Vec<Entry>,
}

impl PrefixMap {
    /// Loads and compiles a map from its textual source. The map name
    /// defaults to the file stem when the source does not set one.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not open {}", path.display()))?;
        let default_name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&text, &default_name)
            .with_context(|| format!("Malformed prefix map {}", path.display()))
    }

    fn parse(text: &str, default_name: &str) -> Result<Self> {
        let mut name = default_name.to_owned();
        let mut mode: Option<bool> = None; // true = ip
        let mut raw: Vec<Entry> = Vec::new();
        let mut saw_v6 = false;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let first = words.next().unwrap();
            match first {
                "map-name" => {
                    name = words
                        .next()
                        .with_context(|| format!("Line {}: missing map name", lineno + 1))?
                        .to_owned();
                }
                "mode" => {
                    mode = match words.next() {
                        Some("ip") => Some(true),
                        Some("proto-port") => Some(false),
                        other => bail!("Line {}: bad mode {:?}", lineno + 1, other),
                    };
                }
                key => {
                    let value: u32 = words
                        .next()
                        .with_context(|| format!("Line {}: missing value", lineno + 1))?
                        .parse()
                        .with_context(|| format!("Line {}: bad value", lineno + 1))?;
                    let is_ip =
                        *mode.get_or_insert_with(|| !key.contains('/') || key.contains(['.', ':']));
                    let (lo, hi, v6) = if is_ip {
                        parse_ip_prefix(key)
                            .with_context(|| format!("Line {}: bad prefix {:?}", lineno + 1, key))?
                    } else {
                        let (lo, hi) = parse_proto_port(key)
                            .with_context(|| format!("Line {}: bad entry {:?}", lineno + 1, key))?;
                        (lo, hi, false)
                    };
                    saw_v6 |= v6;
                    raw.push(Entry { lo, hi, value });
                }
            }
        }
        let content = match mode {
            Some(true) | None => {
                if saw_v6 {
                    PmapContent::Ipv6
                } else {
                    PmapContent::Ipv4
                }
            }
            Some(false) => PmapContent::ProtoPort,
        };
        // Most general first, so that more specific entries paint over.
        raw.sort_by(|a, b| (b.hi - b.lo).cmp(&(a.hi - a.lo)));
        let mut entries: Vec<Entry> = Vec::new();
        for entry in raw {
            paint(&mut entries, entry);
        }
        Ok(PrefixMap {
            name,
            content,
            entries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the map name (a `NAME:PATH` command-line override).
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn content(&self) -> PmapContent {
        self.content
    }

    pub fn lookup_ip(&self, addr: IpAddr) -> Option<u32> {
        ensure_ip(self.content).ok()?;
        self.lookup(ip_to_u128(addr))
    }

    pub fn lookup_proto_port(&self, proto: u8, port: u16) -> Option<u32> {
        if self.content != PmapContent::ProtoPort {
            return None;
        }
        self.lookup(proto_port_key(proto, port))
    }

    fn lookup(&self, key: u128) -> Option<u32> {
        let index = self.entries.partition_point(|entry| entry.hi < key);
        self.entries
            .get(index)
            .filter(|entry| entry.lo <= key)
            .map(|entry| entry.value)
    }
}

fn ensure_ip(content: PmapContent) -> Result<()> {
    ensure!(content.is_ip(), "Not an IP prefix map");
    Ok(())
}

fn proto_port_key(proto: u8, port: u16) -> u128 {
    ((proto as u128) << 16) | port as u128
}

/// Parses `addr[/len]` into an inclusive range of the normalized 16-byte
/// space; returns whether the prefix is native IPv6.
fn parse_ip_prefix(text: &str) -> Result<(u128, u128, bool)> {
    let (addr_text, len_text) = match text.split_once('/') {
        Some((addr, len)) => (addr, Some(len)),
        None => (text, None),
    };
    let addr: IpAddr = addr_text.parse()?;
    let max_len = if addr.is_ipv4() { 32 } else { 128 };
    let len: u32 = match len_text {
        Some(len) => len.parse()?,
        None => max_len,
    };
    ensure!(len <= max_len, "prefix length {} out of range", len);
    let lo = ip_to_u128(addr);
    let span = if len == max_len {
        0
    } else {
        (1u128 << (max_len - len)) - 1
    };
    ensure!(lo & span == 0, "address has bits below the prefix length");
    Ok((lo, lo | span, !addr.is_ipv4()))
}

/// Parses `proto/port`, `proto/lo-hi`, or a bare `proto` (all ports).
fn parse_proto_port(text: &str) -> Result<(u128, u128)> {
    match text.split_once('/') {
        None => {
            let proto: u8 = text.parse()?;
            Ok((proto_port_key(proto, 0), proto_port_key(proto, u16::MAX)))
        }
        Some((proto, ports)) => {
            let proto: u8 = proto.parse()?;
            let (lo, hi) = match ports.split_once('-') {
                None => {
                    let port: u16 = ports.parse()?;
                    (port, port)
                }
                Some((lo, hi)) => (lo.parse()?, hi.parse()?),
            };
            ensure!(lo <= hi, "empty port range");
            Ok((proto_port_key(proto, lo), proto_port_key(proto, hi)))
        }
    }
}

/// Paints `incoming` over a sorted disjoint interval list, truncating or
/// splitting whatever it covers.
fn paint(entries: &mut Vec<Entry>, incoming: Entry) {
    let start = entries.partition_point(|entry| entry.hi < incoming.lo);
    let mut replacement = Vec::with_capacity(3);
    let mut end = start;
    while end < entries.len() && entries[end].lo <= incoming.hi {
        let existing = &entries[end];
        if existing.lo < incoming.lo {
            replacement.push(Entry {
                lo: existing.lo,
                hi: incoming.lo - 1,
                value: existing.value,
            });
        }
        if existing.hi > incoming.hi {
            replacement.push(Entry {
                lo: incoming.hi + 1,
                hi: existing.hi,
                value: existing.value,
            });
        }
        end += 1;
    }
    let tail = replacement.split_off(
        replacement
            .iter()
            .position(|entry| entry.lo > incoming.hi)
            .unwrap_or(replacement.len()),
    );
    replacement.push(incoming);
    replacement.extend(tail);
    entries.splice(start..end, replacement);
}
