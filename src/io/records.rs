/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Reading and writing flow-record corpora.
//!
//! Records are fixed-width and big-endian; addresses are always serialized
//! as 16 bytes, with IPv4 stored v4-mapped and flagged in a per-record
//! indicator byte so the original representation survives a round trip.

use super::{is_stdio, read_preamble, write_preamble, IpPolicy, Metadata};
use crate::flow::{ip_to_u128, u128_to_ip, FlowRecord, TcpFlags};
use anyhow::{bail, Context, Result};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub(crate) const MAGIC: &[u8; 4] = b"FLWR";
const FORMAT: u8 = 1;

/// Serialized size of one record, in bytes.
pub const RECORD_SIZE: usize = 88;

/// Indicator bit: the record's addresses are IPv4.
const REC_V4: u8 = 0x01;

pub(crate) fn encode_record(rec: &FlowRecord, buf: &mut [u8; RECORD_SIZE]) {
    buf[0..16].copy_from_slice(&ip_to_u128(rec.sip).to_be_bytes());
    buf[16..32].copy_from_slice(&ip_to_u128(rec.dip).to_be_bytes());
    buf[32..48].copy_from_slice(&ip_to_u128(rec.nhip).to_be_bytes());
    buf[48..56].copy_from_slice(&rec.stime_ms.to_be_bytes());
    buf[56..60].copy_from_slice(&rec.packets.to_be_bytes());
    buf[60..64].copy_from_slice(&rec.bytes.to_be_bytes());
    buf[64..68].copy_from_slice(&rec.dur_ms.to_be_bytes());
    buf[68..70].copy_from_slice(&rec.sport.to_be_bytes());
    buf[70..72].copy_from_slice(&rec.dport.to_be_bytes());
    buf[72..74].copy_from_slice(&rec.application.to_be_bytes());
    buf[74..76].copy_from_slice(&rec.sensor.to_be_bytes());
    buf[76..78].copy_from_slice(&rec.input.to_be_bytes());
    buf[78..80].copy_from_slice(&rec.output.to_be_bytes());
    buf[80] = rec.proto;
    buf[81] = rec.flags.bits();
    buf[82] = rec.init_flags.bits();
    buf[83] = rec.rest_flags.bits();
    buf[84] = rec.tcp_state;
    buf[85] = rec.flowtype;
    buf[86] = if rec.is_ipv4() { REC_V4 } else { 0 };
    buf[87] = 0;
}

pub(crate) fn decode_record(buf: &[u8; RECORD_SIZE]) -> FlowRecord {
    let v4 = buf[86] & REC_V4 != 0;
    let addr = |range: std::ops::Range<usize>| {
        let bits = u128::from_be_bytes(buf[range].try_into().unwrap());
        if v4 {
            u128_to_ip(bits)
        } else {
            IpAddr::V6(std::net::Ipv6Addr::from_bits(bits))
        }
    };
    FlowRecord {
        sip: addr(0..16),
        dip: addr(16..32),
        nhip: addr(32..48),
        stime_ms: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
        packets: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
        bytes: u32::from_be_bytes(buf[60..64].try_into().unwrap()),
        dur_ms: u32::from_be_bytes(buf[64..68].try_into().unwrap()),
        sport: u16::from_be_bytes(buf[68..70].try_into().unwrap()),
        dport: u16::from_be_bytes(buf[70..72].try_into().unwrap()),
        application: u16::from_be_bytes(buf[72..74].try_into().unwrap()),
        sensor: u16::from_be_bytes(buf[74..76].try_into().unwrap()),
        input: u16::from_be_bytes(buf[76..78].try_into().unwrap()),
        output: u16::from_be_bytes(buf[78..80].try_into().unwrap()),
        proto: buf[80],
        flags: TcpFlags::from_bits_retain(buf[81]),
        init_flags: TcpFlags::from_bits_retain(buf[82]),
        rest_flags: TcpFlags::from_bits_retain(buf[83]),
        tcp_state: buf[84],
        flowtype: buf[85],
    }
}

/// A reader of flow-record corpora, from a file or standard input (`-`).
pub struct RecordReader {
    reader: BufReader<Box<dyn Read + Send>>,
    path: PathBuf,
    metadata: Metadata,
    policy: IpPolicy,
}

impl RecordReader {
    /// Opens a corpus and validates its preamble.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let inner: Box<dyn Read + Send> = if is_stdio(&path) {
            Box::new(std::io::stdin())
        } else {
            Box::new(
                std::fs::File::open(&path)
                    .with_context(|| format!("Could not open {}", path.display()))?,
            )
        };
        let mut reader = BufReader::with_capacity(1 << 16, inner);
        let (format, metadata) = read_preamble(&mut reader, MAGIC, &path)?;
        if format != FORMAT {
            bail!("{}: unsupported record format {}", path.display(), format);
        }
        Ok(RecordReader {
            reader,
            path,
            metadata,
            policy: IpPolicy::Mix,
        })
    }

    /// Sets the IPv6 policy applied to every record read.
    pub fn with_policy(mut self, policy: IpPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the next record, applying the IPv6 policy; `None` at a clean
    /// end of stream. A partial trailing record is an error.
    pub fn read_record(&mut self) -> Result<Option<FlowRecord>> {
        loop {
            let mut buf = [0u8; RECORD_SIZE];
            let mut filled = 0;
            while filled < RECORD_SIZE {
                let n = self
                    .reader
                    .read(&mut buf[filled..])
                    .with_context(|| format!("Read error in {}", self.path.display()))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            match filled {
                0 => return Ok(None),
                RECORD_SIZE => {}
                _ => bail!("Truncated record in {}", self.path.display()),
            }
            let rec = decode_record(&buf);
            match self.policy {
                IpPolicy::Mix => return Ok(Some(rec)),
                IpPolicy::Ignore => {
                    if rec.is_ipv4() {
                        return Ok(Some(rec));
                    }
                }
                IpPolicy::AsV4 => {
                    if rec.is_ipv4() {
                        return Ok(Some(rec));
                    }
                    if let Some(rec) = as_v4(rec) {
                        return Ok(Some(rec));
                    }
                }
                IpPolicy::Force => return Ok(Some(force_v6(rec))),
            }
        }
    }
}

impl Iterator for RecordReader {
    type Item = Result<FlowRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

fn as_v4(mut rec: FlowRecord) -> Option<FlowRecord> {
    let map = |addr: IpAddr| match addr {
        IpAddr::V4(_) => Some(addr),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
    };
    rec.sip = map(rec.sip)?;
    rec.dip = map(rec.dip)?;
    rec.nhip = map(rec.nhip)?;
    Some(rec)
}

fn force_v6(mut rec: FlowRecord) -> FlowRecord {
    let map = |addr: IpAddr| match addr {
        IpAddr::V4(v4) => IpAddr::V6(v4.to_ipv6_mapped()),
        IpAddr::V6(_) => addr,
    };
    rec.sip = map(rec.sip);
    rec.dip = map(rec.dip);
    rec.nhip = map(rec.nhip);
    rec
}

/// A writer of flow-record corpora, to a file or standard output (`-`).
pub struct RecordWriter {
    writer: BufWriter<Box<dyn Write + Send>>,
    path: PathBuf,
    count: u64,
}

impl RecordWriter {
    /// Creates a corpus with the given metadata block.
    pub fn create(path: impl AsRef<Path>, metadata: &Metadata) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let inner: Box<dyn Write + Send> = if is_stdio(&path) {
            Box::new(std::io::stdout())
        } else {
            Box::new(
                std::fs::File::create(&path)
                    .with_context(|| format!("Could not create {}", path.display()))?,
            )
        };
        let mut writer = BufWriter::with_capacity(1 << 16, inner);
        write_preamble(&mut writer, MAGIC, FORMAT, metadata)
            .with_context(|| format!("Could not write header of {}", path.display()))?;
        Ok(RecordWriter {
            writer,
            path,
            count: 0,
        })
    }

    pub fn write_record(&mut self, rec: &FlowRecord) -> Result<()> {
        let mut buf = [0u8; RECORD_SIZE];
        encode_record(rec, &mut buf);
        self.writer
            .write_all(&buf)
            .with_context(|| format!("Write error on {}", self.path.display()))?;
        self.count += 1;
        Ok(())
    }

    /// Writes raw, already-encoded record bytes (used by the merge phase,
    /// which never decodes the records it moves).
    pub(crate) fn write_raw(&mut self, buf: &[u8; RECORD_SIZE]) -> Result<()> {
        self.writer
            .write_all(buf)
            .with_context(|| format!("Write error on {}", self.path.display()))?;
        self.count += 1;
        Ok(())
    }

    /// Flushes the stream and returns the number of records written.
    pub fn finish(mut self) -> Result<u64> {
        self.writer
            .flush()
            .with_context(|| format!("Write error on {}", self.path.display()))?;
        Ok(self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample() -> FlowRecord {
        FlowRecord {
            sip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            dip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
            nhip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            sport: 54321,
            dport: 443,
            proto: 6,
            packets: 12,
            bytes: 3_400,
            stime_ms: 1_700_000_000_123,
            dur_ms: 1_500,
            flags: TcpFlags::SYN | TcpFlags::ACK | TcpFlags::FIN,
            init_flags: TcpFlags::SYN,
            rest_flags: TcpFlags::ACK | TcpFlags::FIN,
            tcp_state: 3,
            application: 443,
            sensor: 2,
            input: 10,
            output: 20,
            flowtype: 1,
        }
    }

    #[test]
    fn test_record_codec_round_trip() {
        let rec = sample();
        let mut buf = [0u8; RECORD_SIZE];
        encode_record(&rec, &mut buf);
        assert_eq!(decode_record(&buf), rec);
    }

    #[test]
    fn test_v6_codec_round_trip() {
        let rec = FlowRecord {
            sip: "2001:db8::1".parse().unwrap(),
            dip: "2001:db8::2".parse().unwrap(),
            nhip: "::".parse().unwrap(),
            ..sample()
        };
        let mut buf = [0u8; RECORD_SIZE];
        encode_record(&rec, &mut buf);
        assert_eq!(decode_record(&buf), rec);
    }

    #[test]
    fn test_stream_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("records");
        let metadata = Metadata {
            invocations: vec!["test".into()],
            annotations: vec![],
        };
        let mut writer = RecordWriter::create(&path, &metadata)?;
        let recs: Vec<_> = (0..100)
            .map(|i| FlowRecord {
                sport: i as u16,
                ..sample()
            })
            .collect();
        for rec in &recs {
            writer.write_record(rec)?;
        }
        assert_eq!(writer.finish()?, 100);

        let mut reader = RecordReader::open(&path)?;
        assert_eq!(reader.metadata().invocations, vec!["test".to_owned()]);
        let mut read_back = Vec::new();
        while let Some(rec) = reader.read_record()? {
            read_back.push(rec);
        }
        assert_eq!(read_back, recs);
        Ok(())
    }

    #[test]
    fn test_empty_stream() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty");
        RecordWriter::create(&path, &Metadata::default())?.finish()?;
        let mut reader = RecordReader::open(&path)?;
        assert!(reader.read_record()?.is_none());
        Ok(())
    }

    #[test]
    fn test_truncated_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("trunc");
        let mut writer = RecordWriter::create(&path, &Metadata::default())?;
        writer.write_record(&sample())?;
        writer.finish()?;
        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() - 7])?;
        let mut reader = RecordReader::open(&path)?;
        assert!(reader.read_record().is_err());
        Ok(())
    }

    #[test]
    fn test_policy_ignore_and_as_v4() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mixed");
        let mut writer = RecordWriter::create(&path, &Metadata::default())?;
        writer.write_record(&sample())?;
        let mapped = FlowRecord {
            sip: "::ffff:192.0.2.9".parse().unwrap(),
            dip: "::ffff:192.0.2.10".parse().unwrap(),
            nhip: "::ffff:0.0.0.0".parse().unwrap(),
            ..sample()
        };
        writer.write_record(&mapped)?;
        let native = FlowRecord {
            sip: "2001:db8::1".parse().unwrap(),
            dip: "2001:db8::2".parse().unwrap(),
            nhip: "::".parse().unwrap(),
            ..sample()
        };
        writer.write_record(&native)?;
        writer.finish()?;

        let count = RecordReader::open(&path)?
            .with_policy(IpPolicy::Ignore)
            .count();
        assert_eq!(count, 1);

        let recs: Vec<_> = RecordReader::open(&path)?
            .with_policy(IpPolicy::AsV4)
            .collect::<Result<_>>()?;
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.is_ipv4()));
        Ok(())
    }

    #[test]
    fn test_policy_force() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("v4");
        let mut writer = RecordWriter::create(&path, &Metadata::default())?;
        writer.write_record(&sample())?;
        writer.finish()?;
        let recs: Vec<_> = RecordReader::open(&path)?
            .with_policy(IpPolicy::Force)
            .collect::<Result<_>>()?;
        assert!(!recs[0].is_ipv4());
        Ok(())
    }
}
