/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Record streams and the shared on-disk container conventions.
//!
//! Every artifact this crate writes (record corpora, bags, IP sets) starts
//! with a four-byte magic, a big-endian version, two format bytes, and a
//! [metadata block](Metadata) carrying the invocation history and free-form
//! annotations of the commands that produced the file.

use anyhow::{bail, ensure, Context, Result};
use std::io::{Read, Write};
use std::path::Path;

mod records;
pub(crate) use records::encode_record;
pub use records::{RecordReader, RecordWriter, RECORD_SIZE};

/// Version written into every container produced by this crate.
pub(crate) const CONTAINER_VERSION: u16 = 1;

/// Tag of an invocation entry in the metadata block.
const META_INVOCATION: u8 = 1;
/// Tag of an annotation entry in the metadata block.
const META_ANNOTATION: u8 = 2;

/// Per-stream IPv6 handling, applied while reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum IpPolicy {
    /// Drop records with IPv6 addresses.
    Ignore,
    /// Convert v4-mapped IPv6 records to IPv4; drop other IPv6 records.
    AsV4,
    /// Keep records as stored.
    #[default]
    Mix,
    /// Convert IPv4 records to their v4-mapped IPv6 form.
    Force,
}

/// Invocation history and annotations carried in a container header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub invocations: Vec<String>,
    pub annotations: Vec<String>,
}

impl Metadata {
    /// Appends all entries of `other`, preserving order.
    pub fn merge(&mut self, other: &Metadata) {
        self.invocations.extend(other.invocations.iter().cloned());
        self.annotations.extend(other.annotations.iter().cloned());
    }

    /// Applies the user's stripping switches and appends the current
    /// invocation and any new notes.
    pub fn finalize(
        mut self,
        invocation: Option<String>,
        notes: &[String],
        strip_notes: bool,
    ) -> Metadata {
        if strip_notes {
            self.annotations.clear();
        }
        if let Some(invocation) = invocation {
            self.invocations.push(invocation);
        }
        self.annotations.extend(notes.iter().cloned());
        self
    }
}

/// Writes a container preamble: magic, version, a format byte, the
/// compression byte (always 0; the slot exists so foreign compressed files
/// are detected and rejected), and the metadata block.
pub(crate) fn write_preamble(
    writer: &mut impl Write,
    magic: &[u8; 4],
    format: u8,
    metadata: &Metadata,
) -> Result<()> {
    writer.write_all(magic)?;
    writer.write_all(&CONTAINER_VERSION.to_be_bytes())?;
    writer.write_all(&[format, 0])?;
    let entries = metadata.invocations.len() + metadata.annotations.len();
    writer.write_all(&u32::try_from(entries)?.to_be_bytes())?;
    for (tag, list) in [
        (META_INVOCATION, &metadata.invocations),
        (META_ANNOTATION, &metadata.annotations),
    ] {
        for entry in list {
            writer.write_all(&[tag])?;
            writer.write_all(&u32::try_from(entry.len())?.to_be_bytes())?;
            writer.write_all(entry.as_bytes())?;
        }
    }
    Ok(())
}

/// Reads and validates a container preamble, returning the format byte and
/// the metadata block.
pub(crate) fn read_preamble(
    reader: &mut impl Read,
    magic: &[u8; 4],
    path: &Path,
) -> Result<(u8, Metadata)> {
    let mut head = [0u8; 8];
    reader
        .read_exact(&mut head)
        .with_context(|| format!("Could not read header of {}", path.display()))?;
    ensure!(
        &head[0..4] == magic,
        "{} is not a {} file (bad magic)",
        path.display(),
        String::from_utf8_lossy(magic),
    );
    let version = u16::from_be_bytes([head[4], head[5]]);
    ensure!(
        version == CONTAINER_VERSION,
        "{}: unsupported version {}",
        path.display(),
        version
    );
    if head[7] != 0 {
        bail!(
            "{}: compressed streams are not supported (method {})",
            path.display(),
            head[7]
        );
    }
    let mut metadata = Metadata::default();
    let mut count = [0u8; 4];
    reader
        .read_exact(&mut count)
        .with_context(|| format!("Could not read header of {}", path.display()))?;
    for _ in 0..u32::from_be_bytes(count) {
        let mut entry_head = [0u8; 5];
        reader
            .read_exact(&mut entry_head)
            .with_context(|| format!("Truncated metadata block in {}", path.display()))?;
        let len = u32::from_be_bytes([entry_head[1], entry_head[2], entry_head[3], entry_head[4]]);
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .with_context(|| format!("Truncated metadata block in {}", path.display()))?;
        let text = String::from_utf8(buf)
            .with_context(|| format!("Malformed metadata entry in {}", path.display()))?;
        match entry_head[0] {
            META_INVOCATION => metadata.invocations.push(text),
            META_ANNOTATION => metadata.annotations.push(text),
            tag => bail!("{}: unknown metadata tag {}", path.display(), tag),
        }
    }
    Ok((head[6], metadata))
}

/// Whether a path denotes the process standard input/output.
pub fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-" || path.as_os_str() == "stdout" || path.as_os_str() == "stdin"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_round_trip() -> Result<()> {
        let metadata = Metadata {
            invocations: vec!["flowkit sort --fields=sport".into()],
            annotations: vec!["first pass".into(), "second note".into()],
        };
        let mut buf = Vec::new();
        write_preamble(&mut buf, b"FLWR", 7, &metadata)?;
        let (format, read_back) =
            read_preamble(&mut buf.as_slice(), b"FLWR", Path::new("mem"))?;
        assert_eq!(format, 7);
        assert_eq!(read_back, metadata);
        Ok(())
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Vec::new();
        write_preamble(&mut buf, b"FLWB", 1, &Metadata::default()).unwrap();
        assert!(read_preamble(&mut buf.as_slice(), b"FLWR", Path::new("mem")).is_err());
    }

    #[test]
    fn test_finalize_strips_and_appends() {
        let metadata = Metadata {
            invocations: vec!["one".into()],
            annotations: vec!["old".into()],
        };
        let out = metadata.finalize(Some("two".into()), &["new".into()], true);
        assert_eq!(out.invocations, vec!["one".to_owned(), "two".to_owned()]);
        assert_eq!(out.annotations, vec!["new".to_owned()]);
    }
}
