/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Sets of IP addresses, kept as sorted disjoint inclusive ranges of the
//! 16-byte normalized form (IPv4 v4-mapped).

use crate::flow::{ip_to_u128, u128_is_v4, u128_to_ip};
use crate::io::{is_stdio, read_preamble, write_preamble, Metadata};
use anyhow::{ensure, Context, Result};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::IpAddr;
use std::path::Path;

pub(crate) const MAGIC: &[u8; 4] = b"FLWS";
const FORMAT: u8 = 1;

/// A set of addresses with the usual set algebra, serialized as ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    /// Sorted, disjoint, non-adjacent inclusive ranges.
    ranges: Vec<(u128, u128)>,
}

impl IpSet {
    pub fn new() -> Self {
        IpSet::default()
    }

    pub fn insert(&mut self, addr: IpAddr) {
        self.insert_bits(ip_to_u128(addr));
    }

    pub fn insert_bits(&mut self, bits: u128) {
        self.insert_range(bits, bits);
    }

    /// Inserts the inclusive range `[lo, hi]`, coalescing with whatever it
    /// touches.
    pub fn insert_range(&mut self, lo: u128, hi: u128) {
        debug_assert!(lo <= hi);
        // First existing range that could touch [lo, hi]: the one whose
        // end reaches lo - 1.
        let start = self
            .ranges
            .partition_point(|&(_, end)| end < lo.saturating_sub(1));
        let mut merged = (lo, hi);
        let mut consumed = start;
        while consumed < self.ranges.len() {
            let (next_lo, next_hi) = self.ranges[consumed];
            if next_lo > hi.saturating_add(1) {
                break;
            }
            merged.0 = merged.0.min(next_lo);
            merged.1 = merged.1.max(next_hi);
            consumed += 1;
        }
        self.ranges.splice(start..consumed, [merged]);
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.contains_bits(ip_to_u128(addr))
    }

    pub fn contains_bits(&self, bits: u128) -> bool {
        let index = self.ranges.partition_point(|&(_, end)| end < bits);
        self.ranges
            .get(index)
            .is_some_and(|&(start, _)| start <= bits)
    }

    /// Number of addresses in the set.
    pub fn count(&self) -> u128 {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo).saturating_add(1))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn union(&mut self, other: &IpSet) {
        for &(lo, hi) in &other.ranges {
            self.insert_range(lo, hi);
        }
    }

    /// Keeps only the addresses also present in `other`.
    pub fn intersect(&mut self, other: &IpSet) {
        let mut result = Vec::new();
        let mut theirs = other.ranges.iter().copied().peekable();
        for &(lo, hi) in &self.ranges {
            while let Some(&(other_lo, other_hi)) = theirs.peek() {
                if other_hi < lo {
                    theirs.next();
                    continue;
                }
                if other_lo > hi {
                    break;
                }
                result.push((lo.max(other_lo), hi.min(other_hi)));
                if other_hi <= hi {
                    theirs.next();
                } else {
                    break;
                }
            }
        }
        self.ranges = result;
    }

    /// Keeps only the addresses *not* present in `other`.
    pub fn complement_intersect(&mut self, other: &IpSet) {
        let mut result = Vec::new();
        for &(lo, hi) in &self.ranges {
            let mut cursor = lo;
            for &(other_lo, other_hi) in &other.ranges {
                if other_hi < cursor {
                    continue;
                }
                if other_lo > hi {
                    break;
                }
                if other_lo > cursor {
                    result.push((cursor, other_lo - 1));
                }
                cursor = other_hi.saturating_add(1);
                if cursor > hi {
                    break;
                }
            }
            if cursor <= hi {
                result.push((cursor, hi));
            }
        }
        self.ranges = result;
    }

    /// The sorted disjoint ranges.
    pub fn iter_ranges(&self) -> impl Iterator<Item = (u128, u128)> + '_ {
        self.ranges.iter().copied()
    }

    /// Every address, ascending. Mind the size of what you iterate.
    pub fn iter_addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ranges
            .iter()
            .flat_map(|&(lo, hi)| (lo..=hi).map(u128_to_ip))
    }

    /// Whether every member is a v4-mapped address.
    pub fn is_all_v4(&self) -> bool {
        self.ranges
            .iter()
            .all(|&(lo, hi)| u128_is_v4(lo) && u128_is_v4(hi))
    }

    pub fn write(&self, path: impl AsRef<Path>, metadata: &Metadata) -> Result<()> {
        let path = path.as_ref();
        let inner: Box<dyn Write + Send> = if is_stdio(path) {
            Box::new(std::io::stdout())
        } else {
            Box::new(
                std::fs::File::create(path)
                    .with_context(|| format!("Could not create {}", path.display()))?,
            )
        };
        let mut writer = BufWriter::with_capacity(1 << 16, inner);
        write_preamble(&mut writer, MAGIC, FORMAT, metadata)
            .with_context(|| format!("Could not write header of {}", path.display()))?;
        writer.write_all(&(self.ranges.len() as u64).to_be_bytes())?;
        for &(lo, hi) in &self.ranges {
            writer.write_all(&lo.to_be_bytes())?;
            writer.write_all(&hi.to_be_bytes())?;
        }
        writer
            .flush()
            .with_context(|| format!("Write error on {}", path.display()))?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<(IpSet, Metadata)> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Could not open {}", path.display()))?;
        let mut reader = BufReader::with_capacity(1 << 16, file);
        let (format, metadata) = read_preamble(&mut reader, MAGIC, path)?;
        ensure!(
            format == FORMAT,
            "{}: unsupported IP-set format {}",
            path.display(),
            format
        );
        let mut count = [0u8; 8];
        reader
            .read_exact(&mut count)
            .with_context(|| format!("Truncated IP set {}", path.display()))?;
        let mut set = IpSet::new();
        for _ in 0..u64::from_be_bytes(count) {
            let mut pair = [0u8; 32];
            reader
                .read_exact(&mut pair)
                .with_context(|| format!("Truncated IP set {}", path.display()))?;
            let lo = u128::from_be_bytes(pair[..16].try_into().unwrap());
            let hi = u128::from_be_bytes(pair[16..].try_into().unwrap());
            ensure!(lo <= hi, "Malformed range in {}", path.display());
            set.insert_range(lo, hi);
        }
        Ok((set, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(addr: &str) -> u128 {
        ip_to_u128(addr.parse().unwrap())
    }

    #[test]
    fn test_insert_and_contains() {
        let mut set = IpSet::new();
        set.insert("10.0.0.1".parse().unwrap());
        set.insert("10.0.0.3".parse().unwrap());
        assert!(set.contains("10.0.0.1".parse().unwrap()));
        assert!(!set.contains("10.0.0.2".parse().unwrap()));
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn test_adjacent_ranges_coalesce() {
        let mut set = IpSet::new();
        set.insert_range(bits("10.0.0.1"), bits("10.0.0.5"));
        set.insert_range(bits("10.0.0.6"), bits("10.0.0.9"));
        assert_eq!(set.iter_ranges().count(), 1);
        set.insert_range(bits("10.0.0.0"), bits("10.0.0.20"));
        assert_eq!(set.iter_ranges().count(), 1);
        assert_eq!(set.count(), 21);
    }

    #[test]
    fn test_intersect() {
        let mut a = IpSet::new();
        a.insert_range(bits("10.0.0.0"), bits("10.0.0.9"));
        let mut b = IpSet::new();
        b.insert_range(bits("10.0.0.5"), bits("10.0.0.20"));
        a.intersect(&b);
        assert_eq!(
            a.iter_ranges().collect::<Vec<_>>(),
            vec![(bits("10.0.0.5"), bits("10.0.0.9"))]
        );
    }

    #[test]
    fn test_complement_intersect() {
        let mut a = IpSet::new();
        a.insert_range(bits("10.0.0.0"), bits("10.0.0.9"));
        let mut b = IpSet::new();
        b.insert_range(bits("10.0.0.3"), bits("10.0.0.5"));
        a.complement_intersect(&b);
        assert_eq!(
            a.iter_ranges().collect::<Vec<_>>(),
            vec![
                (bits("10.0.0.0"), bits("10.0.0.2")),
                (bits("10.0.0.6"), bits("10.0.0.9")),
            ]
        );
    }

    #[test]
    fn test_union() {
        let mut a = IpSet::new();
        a.insert("10.0.0.1".parse().unwrap());
        let mut b = IpSet::new();
        b.insert("10.0.0.2".parse().unwrap());
        b.insert("192.0.2.1".parse().unwrap());
        a.union(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(a.iter_ranges().count(), 2);
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("set");
        let mut set = IpSet::new();
        set.insert_range(bits("10.0.0.0"), bits("10.0.0.255"));
        set.insert("2001:db8::1".parse().unwrap());
        set.write(&path, &Metadata::default())?;
        let (read_back, _) = IpSet::read(&path)?;
        assert_eq!(read_back, set);
        assert!(!read_back.is_all_v4());
        Ok(())
    }

    #[test]
    fn test_iter_addrs() {
        let mut set = IpSet::new();
        set.insert_range(bits("10.0.0.1"), bits("10.0.0.3"));
        let addrs: Vec<String> = set.iter_addrs().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }
}
