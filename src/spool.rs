/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Numbered temporary streams for external sorting.
//!
//! A [`TempSpool`] owns a private scratch directory and hands out
//! monotonically numbered files: created once in write mode, reopened any
//! number of times in read mode, and unlinked individually after a merge
//! pass consumes them. Whatever is still known to the spool is removed when
//! it is dropped, on every exit path.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Environment variable consulted when no temporary directory is configured.
pub const TMPDIR_ENV: &str = "FLOWKIT_TMPDIR";

/// Resolves the base temporary directory: the explicit configuration, the
/// [`TMPDIR_ENV`] environment variable, or the system default.
pub fn resolve_temp_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(TMPDIR_ENV).map(PathBuf::from))
        .unwrap_or_else(std::env::temp_dir)
}

/// Whether an I/O error reports resource exhaustion (out of file
/// descriptors or memory) rather than a hard failure. Callers react by
/// opening fewer files at once.
pub fn is_resource_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM)
    )
}

/// Like [`is_resource_exhaustion`], but looking through an error chain.
pub fn chain_is_resource_exhaustion(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(is_resource_exhaustion)
}

/// A scratch directory of numbered temporary streams.
pub struct TempSpool {
    dir: TempDir,
    next_index: usize,
}

impl TempSpool {
    /// Creates a spool in a fresh private subdirectory of `base` (resolved
    /// through [`resolve_temp_dir`]).
    pub fn new(base: Option<&Path>, prefix: &str) -> Result<Self> {
        let base = resolve_temp_dir(base);
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&base)
            .with_context(|| {
                format!("Could not create temporary directory in {}", base.display())
            })?;
        Ok(TempSpool { dir, next_index: 0 })
    }

    /// The path of the numbered stream `index`.
    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.path().join(format!("{:06x}", index))
    }

    /// Creates the next numbered stream in write mode. Indices are never
    /// reused.
    pub fn create(&mut self) -> Result<(usize, BufWriter<File>)> {
        let index = self.next_index;
        self.next_index += 1;
        let path = self.path(index);
        let file = File::create(&path)
            .with_context(|| format!("Could not create temporary file {}", path.display()))?;
        Ok((index, BufWriter::with_capacity(1 << 16, file)))
    }

    /// Reopens a previously written stream in read mode. The raw error is
    /// returned so callers can classify exhaustion with
    /// [`is_resource_exhaustion`] and retry with a smaller fan-in.
    pub fn reopen(&self, index: usize) -> std::io::Result<File> {
        File::open(self.path(index))
    }

    /// Unlinks a stream once a merge pass has fully consumed it.
    pub fn remove(&self, index: usize) -> Result<()> {
        let path = self.path(index);
        std::fs::remove_file(&path)
            .with_context(|| format!("Could not remove temporary file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_create_reopen_remove() -> Result<()> {
        let mut spool = TempSpool::new(None, "flowkit-test-")?;
        let (index, mut writer) = spool.create()?;
        assert_eq!(index, 0);
        writer.write_all(b"payload")?;
        writer.flush()?;
        let mut buf = String::new();
        spool.reopen(index)?.read_to_string(&mut buf)?;
        assert_eq!(buf, "payload");
        spool.remove(index)?;
        assert!(spool.reopen(index).is_err());
        Ok(())
    }

    #[test]
    fn test_indices_monotonic() -> Result<()> {
        let mut spool = TempSpool::new(None, "flowkit-test-")?;
        let (a, _) = spool.create()?;
        let (b, _) = spool.create()?;
        spool.remove(a)?;
        let (c, _) = spool.create()?;
        assert!(a < b && b < c);
        Ok(())
    }

    #[test]
    fn test_teardown_removes_directory() -> Result<()> {
        let spool_dir;
        {
            let mut spool = TempSpool::new(None, "flowkit-test-")?;
            let (_, mut writer) = spool.create()?;
            writer.write_all(b"x")?;
            writer.flush()?;
            spool_dir = spool.path(0).parent().unwrap().to_path_buf();
            assert!(spool_dir.exists());
        }
        assert!(!spool_dir.exists());
        Ok(())
    }

    #[test]
    fn test_resolve_prefers_configured() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_temp_dir(Some(dir.path())), dir.path());
        assert!(!resolve_temp_dir(None).as_os_str().is_empty());
    }
}
