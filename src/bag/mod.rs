/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Key–counter multisets ("bags").
//!
//! A [`Bag`] maps a typed key of up to 128 bits to a `u64` counter.
//! Addition saturates at `u64::MAX` and sets a sticky overflow flag;
//! subtraction to or below zero removes the key, following multiset
//! semantics. Keys are unordered on insert and ascending on iteration.

use crate::flow::{u128_is_v4, V4_MAPPED_BASE};
use anyhow::{bail, Result};
use std::collections::BTreeMap;

mod io;
pub use io::BagReader;

pub mod algebra;
pub mod pipeline;

/// The typed key of a bag, as recorded in its serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    U8,
    U16,
    U32,
    U64,
    Ipv4,
    Ipv6,
}

impl KeyType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            KeyType::U8 => 1,
            KeyType::U16 => 2,
            KeyType::U32 => 3,
            KeyType::U64 => 4,
            KeyType::Ipv4 => 5,
            KeyType::Ipv6 => 6,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<KeyType> {
        Some(match tag {
            1 => KeyType::U8,
            2 => KeyType::U16,
            3 => KeyType::U32,
            4 => KeyType::U64,
            5 => KeyType::Ipv4,
            6 => KeyType::Ipv6,
            _ => return None,
        })
    }

    /// Serialized key width, in bytes.
    pub fn width(self) -> usize {
        match self {
            KeyType::U8 => 1,
            KeyType::U16 => 2,
            KeyType::U32 | KeyType::Ipv4 => 4,
            KeyType::U64 => 8,
            KeyType::Ipv6 => 16,
        }
    }

    pub fn is_ip(self) -> bool {
        matches!(self, KeyType::Ipv4 | KeyType::Ipv6)
    }

    /// The common key type two bags can be combined under, if any.
    pub fn unify(self, other: KeyType) -> Result<KeyType> {
        if self == other {
            return Ok(self);
        }
        match (self.is_ip(), other.is_ip()) {
            (true, true) => Ok(KeyType::Ipv6),
            (false, false) => Ok(if self.width() >= other.width() {
                self
            } else {
                other
            }),
            _ => bail!("Cannot combine an IP-keyed bag with an integer-keyed bag"),
        }
    }
}

/// Result of [`Bag::insert_or_add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AddStatus {
    Ok,
    /// The counter would have exceeded `u64::MAX`; it was saturated and the
    /// bag's sticky overflow flag is now set.
    Overflow,
}

/// Result of [`Bag::insert_or_subtract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SubStatus {
    Ok,
    /// The subtrahend exceeded the stored counter; the key was removed.
    Underflow,
}

/// A mutable mapping from a typed key to a saturating `u64` counter.
#[derive(Debug, Clone)]
pub struct Bag {
    key_type: KeyType,
    entries: BTreeMap<u128, u64>,
    overflowed: bool,
}

impl Bag {
    pub fn new(key_type: KeyType) -> Self {
        Bag {
            key_type,
            entries: BTreeMap::new(),
            overflowed: false,
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Whether any counter has ever saturated. Sticky.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub(crate) fn set_overflowed(&mut self) {
        self.overflowed = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Widens the key type (e.g. when a true IPv6 key reaches an
    /// IPv4-keyed bag).
    pub fn promote(&mut self, key_type: KeyType) -> Result<()> {
        self.key_type = self.key_type.unify(key_type)?;
        Ok(())
    }

    /// Adds `value` to the counter of `key`, inserting it if absent. On
    /// overflow the counter saturates, the sticky flag is set, and
    /// [`AddStatus::Overflow`] is returned; later additions to the
    /// saturated key succeed silently.
    pub fn insert_or_add(&mut self, key: u128, value: u64) -> AddStatus {
        let counter = self.entries.entry(key).or_insert(0);
        if *counter == u64::MAX {
            return AddStatus::Ok;
        }
        match counter.checked_add(value) {
            Some(sum) => {
                *counter = sum;
                AddStatus::Ok
            }
            None => {
                *counter = u64::MAX;
                self.overflowed = true;
                AddStatus::Overflow
            }
        }
    }

    /// Subtracts `value` from the counter of `key`. Subtracting to zero
    /// deletes the key; subtracting below zero (including from an absent
    /// key) also deletes it and reports [`SubStatus::Underflow`].
    pub fn insert_or_subtract(&mut self, key: u128, value: u64) -> SubStatus {
        let current = self.get(key);
        if value > current {
            self.entries.remove(&key);
            return SubStatus::Underflow;
        }
        if current == value {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, current - value);
        }
        SubStatus::Ok
    }

    /// Sets the counter of `key`; a zero removes the key, since zero
    /// counters are never stored.
    pub fn set(&mut self, key: u128, value: u64) {
        if value == 0 {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// The counter of `key`, zero if absent.
    pub fn get(&self, key: u128) -> u64 {
        self.entries.get(&key).copied().unwrap_or(0)
    }

    pub fn remove(&mut self, key: u128) -> Option<u64> {
        self.entries.remove(&key)
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (u128, u64)> + '_ {
        self.entries.iter().map(|(&key, &counter)| (key, counter))
    }

    /// Keeps only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(u128, u64) -> bool) {
        self.entries.retain(|&key, &mut counter| keep(key, counter));
    }

    /// Replaces the entries wholesale (used by the merge-join operations,
    /// which build their result aside).
    pub(crate) fn replace_entries(&mut self, entries: BTreeMap<u128, u64>) {
        self.entries = entries;
    }

    /// The narrowest key type that can represent every key currently in
    /// the bag; IP bags shrink back to v4 when every key is v4-mapped.
    pub fn effective_key_type(&self) -> KeyType {
        if self.key_type == KeyType::Ipv6 && self.iter().all(|(key, _)| u128_is_v4(key)) {
            KeyType::Ipv4
        } else {
            self.key_type
        }
    }
}

/// Encodes a key for serialization under the given type.
pub(crate) fn encode_key(key_type: KeyType, key: u128) -> Vec<u8> {
    match key_type {
        KeyType::U8 => vec![key as u8],
        KeyType::U16 => (key as u16).to_be_bytes().to_vec(),
        KeyType::U32 => (key as u32).to_be_bytes().to_vec(),
        KeyType::U64 => (key as u64).to_be_bytes().to_vec(),
        KeyType::Ipv4 => ((key - V4_MAPPED_BASE) as u32).to_be_bytes().to_vec(),
        KeyType::Ipv6 => key.to_be_bytes().to_vec(),
    }
}

/// Decodes a serialized key; IPv4 keys come back v4-mapped.
pub(crate) fn decode_key(key_type: KeyType, bytes: &[u8]) -> u128 {
    let raw = bytes.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128);
    match key_type {
        KeyType::Ipv4 => raw + V4_MAPPED_BASE,
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut bag = Bag::new(KeyType::U32);
        assert_eq!(bag.insert_or_add(7, 3), AddStatus::Ok);
        assert_eq!(bag.insert_or_add(7, 4), AddStatus::Ok);
        assert_eq!(bag.get(7), 7);
        assert_eq!(bag.get(8), 0);
    }

    #[test]
    fn test_overflow_saturates_once_and_sticks() {
        let mut bag = Bag::new(KeyType::U8);
        assert_eq!(bag.insert_or_add(1, u64::MAX - 1), AddStatus::Ok);
        assert!(!bag.overflowed());
        assert_eq!(bag.insert_or_add(1, 5), AddStatus::Overflow);
        assert_eq!(bag.get(1), u64::MAX);
        assert!(bag.overflowed());
        // Adding to a saturated key succeeds silently.
        assert_eq!(bag.insert_or_add(1, 5), AddStatus::Ok);
        assert_eq!(bag.get(1), u64::MAX);
        assert!(bag.overflowed());
    }

    #[test]
    fn test_subtract_to_zero_removes() {
        let mut bag = Bag::new(KeyType::U16);
        let _ = bag.insert_or_add(9, 5);
        assert_eq!(bag.insert_or_subtract(9, 5), SubStatus::Ok);
        assert_eq!(bag.get(9), 0);
        assert!(bag.is_empty());
    }

    #[test]
    fn test_subtract_below_zero_removes_and_reports() {
        let mut bag = Bag::new(KeyType::U16);
        let _ = bag.insert_or_add(9, 5);
        assert_eq!(bag.insert_or_subtract(9, 8), SubStatus::Underflow);
        assert_eq!(bag.get(9), 0);
        assert_eq!(bag.insert_or_subtract(10, 1), SubStatus::Underflow);
    }

    #[test]
    fn test_set_zero_removes() {
        let mut bag = Bag::new(KeyType::U16);
        bag.set(3, 10);
        assert_eq!(bag.get(3), 10);
        bag.set(3, 0);
        assert!(bag.is_empty());
    }

    #[test]
    fn test_iteration_is_sorted() {
        let mut bag = Bag::new(KeyType::U64);
        for key in [9u128, 1, 5, 3, 7] {
            let _ = bag.insert_or_add(key, 1);
        }
        let keys: Vec<u128> = bag.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_key_type_unify() {
        assert_eq!(
            KeyType::U8.unify(KeyType::U32).unwrap(),
            KeyType::U32
        );
        assert_eq!(
            KeyType::Ipv4.unify(KeyType::Ipv6).unwrap(),
            KeyType::Ipv6
        );
        assert!(KeyType::U32.unify(KeyType::Ipv4).is_err());
    }

    #[test]
    fn test_key_codec() {
        use crate::flow::ip_to_u128;
        let v4 = ip_to_u128("10.0.0.1".parse().unwrap());
        let bytes = encode_key(KeyType::Ipv4, v4);
        assert_eq!(bytes.len(), 4);
        assert_eq!(decode_key(KeyType::Ipv4, &bytes), v4);
        let v6 = ip_to_u128("2001:db8::1".parse().unwrap());
        assert_eq!(decode_key(KeyType::Ipv6, &encode_key(KeyType::Ipv6, v6)), v6);
        assert_eq!(decode_key(KeyType::U16, &encode_key(KeyType::U16, 443)), 443);
    }

    #[test]
    fn test_effective_key_type_shrinks() {
        use crate::flow::ip_to_u128;
        let mut bag = Bag::new(KeyType::Ipv6);
        let _ = bag.insert_or_add(ip_to_u128("10.0.0.1".parse().unwrap()), 1);
        assert_eq!(bag.effective_key_type(), KeyType::Ipv4);
        let _ = bag.insert_or_add(ip_to_u128("2001:db8::1".parse().unwrap()), 1);
        assert_eq!(bag.effective_key_type(), KeyType::Ipv6);
    }
}
