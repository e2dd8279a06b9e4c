/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Field descriptors and fixed-width sort-key extraction.
//!
//! A [`KeyExtractor`] is configured with an ordered list of fields and
//! writes, for each record, a byte buffer whose lexicographic order is the
//! requested sort order: every field is serialized big-endian and
//! normalized (IPs to 16 bytes v4-mapped, seconds padded to the width of
//! the corresponding millisecond field) so that `memcmp` matches the
//! field's natural order.

use crate::flow::{ip_to_u128, FlowRecord};
use anyhow::{bail, ensure, Context, Result};
use std::cmp::Ordering;

/// A built-in record field usable in a sort or grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Sip,
    Dip,
    Nhip,
    Sport,
    Dport,
    Proto,
    Packets,
    Bytes,
    Flags,
    InitFlags,
    RestFlags,
    TcpState,
    Application,
    Sensor,
    Input,
    Output,
    Flowtype,
    IcmpType,
    IcmpCode,
    /// Start time at second resolution.
    Stime,
    /// Start time at millisecond resolution.
    StimeMs,
    /// End time at second resolution.
    Etime,
    /// End time at millisecond resolution.
    EtimeMs,
    /// Duration at second resolution.
    Dur,
    /// Duration at millisecond resolution.
    DurMs,
}

impl FieldKind {
    /// Every built-in field, in the canonical display order.
    pub const ALL: [FieldKind; 25] = [
        FieldKind::Sip,
        FieldKind::Dip,
        FieldKind::Nhip,
        FieldKind::Sport,
        FieldKind::Dport,
        FieldKind::Proto,
        FieldKind::Packets,
        FieldKind::Bytes,
        FieldKind::Flags,
        FieldKind::InitFlags,
        FieldKind::RestFlags,
        FieldKind::TcpState,
        FieldKind::Application,
        FieldKind::Sensor,
        FieldKind::Input,
        FieldKind::Output,
        FieldKind::Flowtype,
        FieldKind::IcmpType,
        FieldKind::IcmpCode,
        FieldKind::Stime,
        FieldKind::StimeMs,
        FieldKind::Etime,
        FieldKind::EtimeMs,
        FieldKind::Dur,
        FieldKind::DurMs,
    ];

    /// The stored (neither derived nor synthesized) fields, used as the
    /// default compare set for deduplication.
    pub const STORED: [FieldKind; 19] = [
        FieldKind::Sip,
        FieldKind::Dip,
        FieldKind::Nhip,
        FieldKind::Sport,
        FieldKind::Dport,
        FieldKind::Proto,
        FieldKind::Packets,
        FieldKind::Bytes,
        FieldKind::Flags,
        FieldKind::InitFlags,
        FieldKind::RestFlags,
        FieldKind::TcpState,
        FieldKind::Application,
        FieldKind::Sensor,
        FieldKind::Input,
        FieldKind::Output,
        FieldKind::Flowtype,
        FieldKind::StimeMs,
        FieldKind::DurMs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Sip => "sip",
            FieldKind::Dip => "dip",
            FieldKind::Nhip => "nhip",
            FieldKind::Sport => "sport",
            FieldKind::Dport => "dport",
            FieldKind::Proto => "proto",
            FieldKind::Packets => "packets",
            FieldKind::Bytes => "bytes",
            FieldKind::Flags => "flags",
            FieldKind::InitFlags => "init-flags",
            FieldKind::RestFlags => "rest-flags",
            FieldKind::TcpState => "tcp-state",
            FieldKind::Application => "application",
            FieldKind::Sensor => "sensor",
            FieldKind::Input => "in",
            FieldKind::Output => "out",
            FieldKind::Flowtype => "type",
            FieldKind::IcmpType => "icmp-type",
            FieldKind::IcmpCode => "icmp-code",
            FieldKind::Stime => "stime",
            FieldKind::StimeMs => "stime-ms",
            FieldKind::Etime => "etime",
            FieldKind::EtimeMs => "etime-ms",
            FieldKind::Dur => "dur",
            FieldKind::DurMs => "dur-ms",
        }
    }

    /// Parses a field identifier, accepting a few historical aliases.
    pub fn parse(name: &str) -> Option<FieldKind> {
        let name = name.trim();
        if let Some(kind) = Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
        {
            return Some(kind);
        }
        match name.to_ascii_lowercase().as_str() {
            "duration" => Some(FieldKind::Dur),
            "duration-ms" => Some(FieldKind::DurMs),
            "input" => Some(FieldKind::Input),
            "output" => Some(FieldKind::Output),
            "flowtype" => Some(FieldKind::Flowtype),
            "protocol" => Some(FieldKind::Proto),
            _ => None,
        }
    }

    /// Width of the field's key bytes.
    pub fn width(self) -> usize {
        match self {
            FieldKind::Sip | FieldKind::Dip | FieldKind::Nhip => 16,
            FieldKind::Stime | FieldKind::StimeMs | FieldKind::Etime | FieldKind::EtimeMs => 8,
            FieldKind::Packets | FieldKind::Bytes | FieldKind::Dur | FieldKind::DurMs => 4,
            FieldKind::Sport
            | FieldKind::Dport
            | FieldKind::Application
            | FieldKind::Sensor
            | FieldKind::Input
            | FieldKind::Output => 2,
            FieldKind::Proto
            | FieldKind::Flags
            | FieldKind::InitFlags
            | FieldKind::RestFlags
            | FieldKind::TcpState
            | FieldKind::Flowtype
            | FieldKind::IcmpType
            | FieldKind::IcmpCode => 1,
        }
    }

    /// Writes the field's normalized big-endian bytes into `buf`, which
    /// must be exactly [`width`](FieldKind::width) long.
    pub fn write(self, rec: &FlowRecord, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.width());
        match self {
            FieldKind::Sip => buf.copy_from_slice(&ip_to_u128(rec.sip).to_be_bytes()),
            FieldKind::Dip => buf.copy_from_slice(&ip_to_u128(rec.dip).to_be_bytes()),
            FieldKind::Nhip => buf.copy_from_slice(&ip_to_u128(rec.nhip).to_be_bytes()),
            FieldKind::Sport => buf.copy_from_slice(&rec.sport.to_be_bytes()),
            FieldKind::Dport => buf.copy_from_slice(&rec.dport.to_be_bytes()),
            FieldKind::Proto => buf[0] = rec.proto,
            FieldKind::Packets => buf.copy_from_slice(&rec.packets.to_be_bytes()),
            FieldKind::Bytes => buf.copy_from_slice(&rec.bytes.to_be_bytes()),
            FieldKind::Flags => buf[0] = rec.flags.bits(),
            FieldKind::InitFlags => buf[0] = rec.init_flags.bits(),
            FieldKind::RestFlags => buf[0] = rec.rest_flags.bits(),
            FieldKind::TcpState => buf[0] = rec.tcp_state,
            FieldKind::Application => buf.copy_from_slice(&rec.application.to_be_bytes()),
            FieldKind::Sensor => buf.copy_from_slice(&rec.sensor.to_be_bytes()),
            FieldKind::Input => buf.copy_from_slice(&rec.input.to_be_bytes()),
            FieldKind::Output => buf.copy_from_slice(&rec.output.to_be_bytes()),
            FieldKind::Flowtype => buf[0] = rec.flowtype,
            FieldKind::IcmpType => buf[0] = rec.icmp_type(),
            FieldKind::IcmpCode => buf[0] = rec.icmp_code(),
            FieldKind::Stime => buf.copy_from_slice(&(rec.stime_ms / 1000).to_be_bytes()),
            FieldKind::StimeMs => buf.copy_from_slice(&rec.stime_ms.to_be_bytes()),
            FieldKind::Etime => buf.copy_from_slice(&(rec.etime_ms() / 1000).to_be_bytes()),
            FieldKind::EtimeMs => buf.copy_from_slice(&rec.etime_ms().to_be_bytes()),
            FieldKind::Dur => buf.copy_from_slice(&(rec.dur_ms / 1000).to_be_bytes()),
            FieldKind::DurMs => buf.copy_from_slice(&rec.dur_ms.to_be_bytes()),
        }
    }
}

/// A user-supplied key field: a name, a declared binary width, a
/// record-to-bytes function, and an optional comparator for key bytes that
/// do not sort in `memcmp` order.
///
/// Built-in fields and plug-ins share this seam; the set of active
/// providers is a configuration input to [`KeyExtractor`].
pub trait FieldProvider: Send + Sync {
    fn name(&self) -> &str;

    fn width(&self) -> usize;

    /// Writes the field's key bytes for `rec` into `buf` (exactly
    /// [`width`](FieldProvider::width) bytes). A failure here aborts the
    /// whole pipeline with a diagnostic naming the field.
    fn write(&self, rec: &FlowRecord, buf: &mut [u8]) -> Result<()>;

    /// Compares two key-byte slices previously produced by
    /// [`write`](FieldProvider::write).
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// One entry of a key layout.
pub enum KeyField {
    Builtin(FieldKind),
    Provider(Box<dyn FieldProvider>),
}

impl KeyField {
    fn width(&self) -> usize {
        match self {
            KeyField::Builtin(kind) => kind.width(),
            KeyField::Provider(provider) => provider.width(),
        }
    }
}

/// Produces fixed-width comparable key buffers from flow records.
pub struct KeyExtractor {
    fields: Vec<KeyField>,
    width: usize,
    all_builtin: bool,
}

impl KeyExtractor {
    pub fn new(fields: Vec<KeyField>) -> Self {
        let width = fields.iter().map(KeyField::width).sum();
        let all_builtin = fields
            .iter()
            .all(|field| matches!(field, KeyField::Builtin(_)));
        KeyExtractor {
            fields,
            width,
            all_builtin,
        }
    }

    /// Builds an extractor over built-in fields only.
    pub fn from_kinds(kinds: impl IntoIterator<Item = FieldKind>) -> Self {
        Self::new(kinds.into_iter().map(KeyField::Builtin).collect())
    }

    /// Parses a comma-separated field list, e.g. `sip,dip,proto,sport,dport`.
    pub fn from_field_list(list: &str) -> Result<Self> {
        Ok(Self::from_kinds(parse_field_list(list)?))
    }

    /// Total key width, in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Writes the key for `rec` into `buf`, which must be exactly
    /// [`width`](KeyExtractor::width) bytes. Infallible for built-in
    /// fields; a plug-in failure aborts with the field's name.
    pub fn write_key(&self, rec: &FlowRecord, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.width);
        let mut offset = 0;
        for field in &self.fields {
            let slot = &mut buf[offset..offset + field.width()];
            match field {
                KeyField::Builtin(kind) => kind.write(rec, slot),
                KeyField::Provider(provider) => provider
                    .write(rec, slot)
                    .with_context(|| format!("Key field {} failed", provider.name()))?,
            }
            offset += field.width();
        }
        Ok(())
    }

    /// Compares two keys previously produced by
    /// [`write_key`](KeyExtractor::write_key).
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if self.all_builtin {
            return a.cmp(b);
        }
        let mut offset = 0;
        for field in &self.fields {
            let width = field.width();
            let (fa, fb) = (&a[offset..offset + width], &b[offset..offset + width]);
            let ordering = match field {
                KeyField::Builtin(_) => fa.cmp(fb),
                KeyField::Provider(provider) => provider.compare(fa, fb),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
            offset += width;
        }
        Ordering::Equal
    }
}

/// Parses a comma-separated list of built-in field names, rejecting unknown
/// names and duplicates.
pub fn parse_field_list(list: &str) -> Result<Vec<FieldKind>> {
    let mut kinds = Vec::new();
    for name in list.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let Some(kind) = FieldKind::parse(name) else {
            bail!("Unknown field {:?}", name);
        };
        ensure!(!kinds.contains(&kind), "Duplicate field {:?}", name);
        kinds.push(kind);
    }
    ensure!(!kinds.is_empty(), "Empty field list");
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_width() {
        let extractor = KeyExtractor::from_field_list("sip,sport,proto").unwrap();
        assert_eq!(extractor.width(), 16 + 2 + 1);
    }

    #[test]
    fn test_canonical_keys() {
        // Two records with equal user-visible field values must produce
        // byte-equal keys even across IPv4/v6-mapped representations.
        let extractor = KeyExtractor::from_field_list("sip,dport").unwrap();
        let a = FlowRecord {
            sip: "192.0.2.1".parse().unwrap(),
            dport: 80,
            ..Default::default()
        };
        let b = FlowRecord {
            sip: "::ffff:192.0.2.1".parse().unwrap(),
            dport: 80,
            ..Default::default()
        };
        let mut ka = vec![0; extractor.width()];
        let mut kb = vec![0; extractor.width()];
        extractor.write_key(&a, &mut ka).unwrap();
        extractor.write_key(&b, &mut kb).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_memcmp_matches_field_order() {
        let extractor = KeyExtractor::from_field_list("bytes").unwrap();
        let small = FlowRecord {
            bytes: 0x0100,
            ..Default::default()
        };
        let large = FlowRecord {
            bytes: 0x0200,
            ..Default::default()
        };
        let mut ks = vec![0; 4];
        let mut kl = vec![0; 4];
        extractor.write_key(&small, &mut ks).unwrap();
        extractor.write_key(&large, &mut kl).unwrap();
        assert!(ks < kl);
    }

    #[test]
    fn test_seconds_resolution_padding() {
        // Seconds and milliseconds share the same width, so keys built at
        // different resolutions stay cross-comparable.
        assert_eq!(FieldKind::Stime.width(), FieldKind::StimeMs.width());
        assert_eq!(FieldKind::Dur.width(), FieldKind::DurMs.width());
        let rec = FlowRecord {
            stime_ms: 12_345,
            ..Default::default()
        };
        let mut buf = [0u8; 8];
        FieldKind::Stime.write(&rec, &mut buf);
        assert_eq!(u64::from_be_bytes(buf), 12);
    }

    #[test]
    fn test_parse_rejects_unknown_and_duplicates() {
        assert!(parse_field_list("sip,frobs").is_err());
        assert!(parse_field_list("sip,sip").is_err());
        assert!(parse_field_list("").is_err());
        assert_eq!(
            parse_field_list("Duration, input").unwrap(),
            vec![FieldKind::Dur, FieldKind::Input]
        );
    }

    #[test]
    fn test_icmp_zero_for_non_icmp() {
        let extractor = KeyExtractor::from_field_list("icmp-type,icmp-code").unwrap();
        let tcp = FlowRecord {
            proto: 6,
            dport: 0x1234,
            ..Default::default()
        };
        let mut key = vec![0xffu8; 2];
        extractor.write_key(&tcp, &mut key).unwrap();
        assert_eq!(key, vec![0, 0]);
    }

    struct ReverseBytes;

    impl FieldProvider for ReverseBytes {
        fn name(&self) -> &str {
            "reverse-bytes"
        }
        fn width(&self) -> usize {
            4
        }
        fn write(&self, rec: &FlowRecord, buf: &mut [u8]) -> Result<()> {
            buf.copy_from_slice(&rec.bytes.to_be_bytes());
            Ok(())
        }
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
    }

    #[test]
    fn test_provider_comparator() {
        let extractor = KeyExtractor::new(vec![
            KeyField::Builtin(FieldKind::Proto),
            KeyField::Provider(Box::new(ReverseBytes)),
        ]);
        let a = FlowRecord {
            proto: 6,
            bytes: 10,
            ..Default::default()
        };
        let b = FlowRecord {
            proto: 6,
            bytes: 20,
            ..Default::default()
        };
        let mut ka = vec![0; extractor.width()];
        let mut kb = vec![0; extractor.width()];
        extractor.write_key(&a, &mut ka).unwrap();
        extractor.write_key(&b, &mut kb).unwrap();
        // The provider sorts descending.
        assert_eq!(extractor.compare(&ka, &kb), Ordering::Greater);
    }

    struct Failing;

    impl FieldProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn width(&self) -> usize {
            1
        }
        fn write(&self, _: &FlowRecord, _: &mut [u8]) -> Result<()> {
            bail!("callback failure")
        }
    }

    #[test]
    fn test_provider_failure_names_field() {
        let extractor = KeyExtractor::new(vec![KeyField::Provider(Box::new(Failing))]);
        let mut key = vec![0; 1];
        let err = extractor
            .write_key(&FlowRecord::default(), &mut key)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("failing"));
    }
}
