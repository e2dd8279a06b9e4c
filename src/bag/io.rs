/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The serialized form of a bag.
//!
//! After the shared container preamble come the key-type and counter-type
//! tags, the entry count, and the `(key, counter)` pairs in ascending key
//! order, keys fixed-width per key type and counters as big-endian `u64`.

use super::{decode_key, encode_key, Bag, KeyType};
use crate::io::{is_stdio, read_preamble, write_preamble, Metadata};
use anyhow::{bail, ensure, Context, Result};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub(crate) const MAGIC: &[u8; 4] = b"FLWB";
const FORMAT: u8 = 1;
/// The only counter type this crate produces.
const COUNTER_U64: u8 = 1;

impl Bag {
    /// Serializes the bag, narrowing IP key types when every key fits
    /// ([`Bag::effective_key_type`]).
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
        let key_type = self.effective_key_type();
        writer.write_all(&[key_type.tag(), COUNTER_U64])?;
        writer.write_all(&(self.len() as u64).to_be_bytes())?;
        for (key, counter) in self.iter() {
            writer.write_all(&encode_key(key_type, key))?;
            writer.write_all(&counter.to_be_bytes())?;
        }
        writer
            .flush()
            .with_context(|| format!("Write error on {}", path.display()))?;
        Ok(())
    }

    /// Reads a whole bag into memory.
    pub fn read(path: impl AsRef<Path>) -> Result<(Bag, Metadata)> {
        let mut reader = BagReader::open(path)?;
        let mut bag = Bag::new(reader.key_type());
        while let Some((key, counter)) = reader.next_entry()? {
            bag.set(key, counter);
        }
        Ok((bag, reader.into_metadata()))
    }
}

/// A streaming reader of serialized bags; entries come out in ascending
/// key order, as stored.
pub struct BagReader {
    reader: BufReader<Box<dyn Read + Send>>,
    path: PathBuf,
    metadata: Metadata,
    key_type: KeyType,
    remaining: u64,
}

impl BagReader {
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
        ensure!(
            format == FORMAT,
            "{}: unsupported bag format {}",
            path.display(),
            format
        );
        let mut tags = [0u8; 10];
        reader
            .read_exact(&mut tags)
            .with_context(|| format!("Could not read bag header of {}", path.display()))?;
        let Some(key_type) = KeyType::from_tag(tags[0]) else {
            bail!("{}: unknown bag key type {}", path.display(), tags[0]);
        };
        ensure!(
            tags[1] == COUNTER_U64,
            "{}: unknown bag counter type {}",
            path.display(),
            tags[1]
        );
        let remaining = u64::from_be_bytes(tags[2..10].try_into().unwrap());
        Ok(BagReader {
            reader,
            path,
            metadata,
            key_type,
            remaining,
        })
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> Metadata {
        self.metadata
    }

    /// The next `(key, counter)` pair, `None` after the last.
    pub fn next_entry(&mut self) -> Result<Option<(u128, u64)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut key_bytes = [0u8; 16];
        let width = self.key_type.width();
        self.reader
            .read_exact(&mut key_bytes[..width])
            .with_context(|| format!("Truncated bag entry in {}", self.path.display()))?;
        let mut counter_bytes = [0u8; 8];
        self.reader
            .read_exact(&mut counter_bytes)
            .with_context(|| format!("Truncated bag entry in {}", self.path.display()))?;
        Ok(Some((
            decode_key(self.key_type, &key_bytes[..width]),
            u64::from_be_bytes(counter_bytes),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ip_to_u128;

    #[test]
    fn test_bag_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bag");
        let mut bag = Bag::new(KeyType::U16);
        for (key, counter) in [(443u128, 10u64), (80, 2), (22, 7)] {
            bag.set(key, counter);
        }
        let metadata = Metadata {
            invocations: vec!["flowkit bag".into()],
            annotations: vec!["note".into()],
        };
        bag.write(&path, &metadata)?;

        let (read_back, read_metadata) = Bag::read(&path)?;
        assert_eq!(read_back.key_type(), KeyType::U16);
        assert_eq!(read_metadata, metadata);
        let entries: Vec<_> = read_back.iter().collect();
        assert_eq!(entries, vec![(22, 7), (80, 2), (443, 10)]);
        Ok(())
    }

    #[test]
    fn test_ip_bag_narrows_to_v4() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bag");
        let mut bag = Bag::new(KeyType::Ipv6);
        let key = ip_to_u128("10.1.2.3".parse().unwrap());
        bag.set(key, 5);
        bag.write(&path, &Metadata::default())?;
        let mut reader = BagReader::open(&path)?;
        assert_eq!(reader.key_type(), KeyType::Ipv4);
        assert_eq!(reader.next_entry()?, Some((key, 5)));
        assert_eq!(reader.next_entry()?, None);
        Ok(())
    }

    #[test]
    fn test_empty_bag_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bag");
        Bag::new(KeyType::U32).write(&path, &Metadata::default())?;
        let (bag, _) = Bag::read(&path)?;
        assert!(bag.is_empty());
        Ok(())
    }

    #[test]
    fn test_rejects_record_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("records");
        crate::io::RecordWriter::create(&path, &Metadata::default())?.finish()?;
        assert!(BagReader::open(&path).is_err());
        Ok(())
    }
}
