/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Filing processed inputs into an archive tree.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Moves finished files into an archive (flat or time-partitioned) and
/// optionally runs a post-command on each archived file.
pub struct ArchiveFiler {
    archive_root: Option<PathBuf>,
    flat: bool,
    post_command: Option<String>,
    shell: PathBuf,
}

impl ArchiveFiler {
    pub fn new(
        archive_root: Option<PathBuf>,
        flat: bool,
        post_command: Option<String>,
        shell: PathBuf,
    ) -> Self {
        ArchiveFiler {
            archive_root,
            flat,
            post_command,
            shell,
        }
    }

    /// Files `source`: with no archive root the file is deleted; otherwise
    /// it moves under the root, into `YYYY/MM/DD/HH` of the local wall
    /// clock unless the archive is flat or `subpath` overrides the
    /// partition. Returns the destination, `None` when deleted.
    pub fn file(&self, source: &Path, subpath: Option<&Path>) -> Result<Option<PathBuf>> {
        let Some(root) = &self.archive_root else {
            std::fs::remove_file(source)
                .with_context(|| format!("Could not remove {}", source.display()))?;
            return Ok(None);
        };
        let dir = if self.flat {
            root.clone()
        } else if let Some(subpath) = subpath {
            root.join(subpath)
        } else {
            root.join(jiff::Zoned::now().strftime("%Y/%m/%d/%H").to_string())
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Could not create {}", dir.display()))?;
        let name = source
            .file_name()
            .with_context(|| format!("{} has no file name", source.display()))?;
        let destination = dir.join(name);
        move_file(source, &destination)?;
        if let Some(template) = &self.post_command {
            let command = template.replace("%s", &destination.display().to_string());
            match Command::new(&self.shell).arg("-c").arg(&command).status() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    log::warn!("Post-archive command {:?} exited with {}", command, status)
                }
                Err(err) => log::warn!("Could not run post-archive command {:?}: {}", command, err),
            }
        }
        Ok(Some(destination))
    }
}

/// Renames `source` to `destination`, falling back to copy-then-unlink
/// when they live on different filesystems.
pub(crate) fn move_file(source: &Path, destination: &Path) -> Result<()> {
    match std::fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            std::fs::copy(source, destination).with_context(|| {
                format!(
                    "Could not copy {} to {}",
                    source.display(),
                    destination.display()
                )
            })?;
            std::fs::remove_file(source)
                .with_context(|| format!("Could not remove {}", source.display()))
        }
        Err(err) => Err(err).with_context(|| {
            format!(
                "Could not move {} to {}",
                source.display(),
                destination.display()
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::write(path, b"payload").unwrap();
    }

    #[test]
    fn test_no_archive_deletes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("input");
        touch(&source);
        let filer = ArchiveFiler::new(None, false, None, PathBuf::from("/bin/sh"));
        assert_eq!(filer.file(&source, None)?, None);
        assert!(!source.exists());
        Ok(())
    }

    #[test]
    fn test_flat_archive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("input");
        touch(&source);
        let root = dir.path().join("archive");
        let filer = ArchiveFiler::new(Some(root.clone()), true, None, PathBuf::from("/bin/sh"));
        let destination = filer.file(&source, None)?.unwrap();
        assert_eq!(destination, root.join("input"));
        assert!(destination.exists());
        assert!(!source.exists());
        Ok(())
    }

    #[test]
    fn test_partitioned_archive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("input");
        touch(&source);
        let root = dir.path().join("archive");
        let filer = ArchiveFiler::new(Some(root.clone()), false, None, PathBuf::from("/bin/sh"));
        let destination = filer.file(&source, None)?.unwrap();
        // root/YYYY/MM/DD/HH/input
        let relative = destination.strip_prefix(&root).unwrap();
        assert_eq!(relative.components().count(), 5);
        assert!(destination.exists());
        Ok(())
    }

    #[test]
    fn test_explicit_subpath() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("input");
        touch(&source);
        let root = dir.path().join("archive");
        let filer = ArchiveFiler::new(Some(root.clone()), false, None, PathBuf::from("/bin/sh"));
        let destination = filer.file(&source, Some(Path::new("by-hand")))?.unwrap();
        assert_eq!(destination, root.join("by-hand").join("input"));
        Ok(())
    }

    #[test]
    fn test_post_command_runs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("input");
        touch(&source);
        let root = dir.path().join("archive");
        let marker = dir.path().join("marker");
        let filer = ArchiveFiler::new(
            Some(root),
            true,
            Some(format!("cp %s {}", marker.display())),
            PathBuf::from("/bin/sh"),
        );
        filer.file(&source, None)?;
        assert!(marker.exists());
        Ok(())
    }

    #[test]
    fn test_post_command_failure_is_not_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("input");
        touch(&source);
        let filer = ArchiveFiler::new(
            Some(dir.path().join("archive")),
            true,
            Some("exit 3".to_owned()),
            PathBuf::from("/bin/sh"),
        );
        assert!(filer.file(&source, None)?.is_some());
        Ok(())
    }
}
