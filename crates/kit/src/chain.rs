//! Copy-on-write disk image chain
//!
//! A workspace owns one ordered qcow2 chain: a sized `base.qcow2`
//! followed by `sda-<seq>.qcow2` snapshots, each backed by its
//! predecessor. Ordering comes from the sequence number embedded in
//! the file name, not from filesystem timestamps.
//!
//! Mutation assumes a single writer per workspace; that exclusion is
//! provided by the workspace pidfile, not by this type.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::hostexec::{ExecError, HostExec};

/// Chain state or mutation failure.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no disk image available in {workspace}")]
    Empty { workspace: PathBuf },
    #[error("chain in {workspace} already has {len} image(s)")]
    AlreadyInitialized { workspace: PathBuf, len: usize },
    #[error("cannot roll back: only the base image is left in {workspace}")]
    BaseOnly { workspace: PathBuf },
    #[error("scanning {workspace}: {source}")]
    Scan {
        workspace: PathBuf,
        source: std::io::Error,
    },
    #[error("removing {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// One link of the chain. Immutable once created; the backing
/// reference is the image that was the tail at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub path: PathBuf,
    pub backing: Option<PathBuf>,
    pub seq: u64,
}

const BASE_IMAGE: &str = "base.qcow2";

/// Ordered append-only sequence of qcow2 images in one workspace.
#[derive(Clone)]
pub struct DiskChain {
    work_dir: PathBuf,
    exec: Arc<dyn HostExec>,
}

impl std::fmt::Debug for DiskChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskChain")
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl DiskChain {
    pub fn new(work_dir: impl Into<PathBuf>, exec: Arc<dyn HostExec>) -> Self {
        Self {
            work_dir: work_dir.into(),
            exec,
        }
    }

    /// The chain in creation order: base first, newest snapshot last.
    pub fn entries(&self) -> Result<Vec<DiskImage>, ChainError> {
        let snapshot_re = Regex::new(r"^sda-(\d+)\.qcow2$").unwrap();
        let mut snapshots = Vec::new();
        let mut base = None;
        let iter = std::fs::read_dir(&self.work_dir).map_err(|e| ChainError::Scan {
            workspace: self.work_dir.clone(),
            source: e,
        })?;
        for entry in iter {
            let entry = entry.map_err(|e| ChainError::Scan {
                workspace: self.work_dir.clone(),
                source: e,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == BASE_IMAGE {
                base = Some(entry.path());
            } else if let Some(c) = snapshot_re.captures(name) {
                // A sequence number too large for u64 is not ours.
                if let Ok(seq) = c[1].parse::<u64>() {
                    snapshots.push((seq, entry.path()));
                }
            }
        }
        snapshots.sort_by_key(|(seq, _)| *seq);

        let mut chain = Vec::new();
        let mut backing = None;
        if let Some(path) = base {
            chain.push(DiskImage {
                path: path.clone(),
                backing: None,
                seq: 0,
            });
            backing = Some(path);
        }
        for (seq, path) in snapshots {
            chain.push(DiskImage {
                path: path.clone(),
                backing: backing.clone(),
                seq,
            });
            backing = Some(path);
        }
        Ok(chain)
    }

    /// Create the sized base image. Fails if the chain is non-empty.
    pub fn init(&self, disk_size: &str) -> Result<PathBuf, ChainError> {
        let entries = self.entries()?;
        if !entries.is_empty() {
            return Err(ChainError::AlreadyInitialized {
                workspace: self.work_dir.clone(),
                len: entries.len(),
            });
        }
        let base = self.work_dir.join(BASE_IMAGE);
        let base_str = base.to_string_lossy();
        self.exec.run(&[
            "qemu-img", "create", "-f", "qcow2", &base_str, disk_size,
        ])?;
        info!("created base image {}", base.display());
        Ok(base)
    }

    /// Append an empty snapshot backed by the current tail, which is
    /// used both to seal the base after bootstrap and for every later
    /// snapshot. The new image becomes the tail.
    pub fn shift(&self) -> Result<PathBuf, ChainError> {
        let entries = self.entries()?;
        let Some(tail) = entries.last() else {
            return Err(ChainError::Empty {
                workspace: self.work_dir.clone(),
            });
        };
        let seq = tail.seq + 1;
        let path = self.work_dir.join(format!("sda-{seq:04}.qcow2"));
        let path_str = path.to_string_lossy();
        let backing = tail.path.to_string_lossy();
        self.exec.run(&[
            "qemu-img", "create", "-f", "qcow2", "-b", &backing, "-F", "qcow2", &path_str,
        ])?;
        info!("shifted image, current is {}", path.display());
        Ok(path)
    }

    /// Delete the tail snapshot; the predecessor becomes the tail
    /// again. The base image can never be rolled back.
    pub fn rollback(&self) -> Result<(), ChainError> {
        let entries = self.entries()?;
        if entries.is_empty() {
            return Err(ChainError::Empty {
                workspace: self.work_dir.clone(),
            });
        }
        if entries.len() == 1 {
            return Err(ChainError::BaseOnly {
                workspace: self.work_dir.clone(),
            });
        }
        let tail = &entries[entries.len() - 1];
        info!("removing {}", tail.path.display());
        std::fs::remove_file(&tail.path).map_err(|e| ChainError::Remove {
            path: tail.path.clone(),
            source: e,
        })
    }

    /// Path of the current tail image.
    pub fn current(&self) -> Result<PathBuf, ChainError> {
        self.entries()?
            .last()
            .map(|img| img.path.clone())
            .ok_or_else(|| ChainError::Empty {
                workspace: self.work_dir.clone(),
            })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::hostexec::testutil::RecordingExec;

    fn chain(dir: &TempDir) -> (Arc<RecordingExec>, DiskChain) {
        let exec = Arc::new(RecordingExec::new());
        (exec.clone(), DiskChain::new(dir.path(), exec))
    }

    #[test]
    fn test_init_then_shift_builds_backing_chain() {
        let dir = TempDir::new().unwrap();
        let (exec, chain) = chain(&dir);

        chain.init("10G").unwrap();
        for _ in 0..3 {
            chain.shift().unwrap();
        }

        let entries = chain.entries().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].backing, None);
        for i in 1..entries.len() {
            assert_eq!(entries[i].backing.as_ref(), Some(&entries[i - 1].path));
        }
        assert_eq!(chain.current().unwrap(), entries[3].path);

        // The base is created with the requested virtual size, the
        // snapshots with a backing file and no size.
        let commands = exec.recorded();
        assert_eq!(
            commands[0][..4],
            ["qemu-img", "create", "-f", "qcow2"]
        );
        assert!(commands[0].last().unwrap().ends_with("10G"));
        assert!(commands[1].contains(&"-b".to_string()));
        assert!(commands[1]
            .iter()
            .any(|a| a.ends_with("base.qcow2")));
    }

    #[test]
    fn test_foreign_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (_, chain) = chain(&dir);
        chain.init("10G").unwrap();
        chain.shift().unwrap();
        std::fs::write(dir.path().join("config.yml"), b"").unwrap();
        std::fs::write(dir.path().join("sda-extra.qcow2"), b"").unwrap();
        std::fs::write(
            dir.path().join("sda-999999999999999999999999.qcow2"),
            b"",
        )
        .unwrap();

        let entries = chain.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].path.ends_with("sda-0001.qcow2"));
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        let (_, chain) = chain(&dir);
        chain.init("10G").unwrap();
        assert!(matches!(
            chain.init("10G"),
            Err(ChainError::AlreadyInitialized { len: 1, .. })
        ));
    }

    #[test]
    fn test_shift_on_empty_chain_fails() {
        let dir = TempDir::new().unwrap();
        let (_, chain) = chain(&dir);
        assert!(matches!(chain.shift(), Err(ChainError::Empty { .. })));
        assert!(matches!(chain.current(), Err(ChainError::Empty { .. })));
    }

    #[test]
    fn test_rollback_deletes_exactly_the_tail() {
        let dir = TempDir::new().unwrap();
        let (_, chain) = chain(&dir);
        chain.init("10G").unwrap();
        chain.shift().unwrap();
        chain.shift().unwrap();

        let before = chain.entries().unwrap();
        let tail = before.last().unwrap().path.clone();
        chain.rollback().unwrap();

        let after = chain.entries().unwrap();
        assert_eq!(after.len(), before.len() - 1);
        assert!(!tail.exists());
        assert!(after.iter().all(|img| img.path.exists()));
    }

    #[test]
    fn test_rollback_base_only_fails_and_keeps_chain() {
        let dir = TempDir::new().unwrap();
        let (_, chain) = chain(&dir);
        chain.init("10G").unwrap();

        assert!(matches!(
            chain.rollback(),
            Err(ChainError::BaseOnly { .. })
        ));
        assert_eq!(chain.entries().unwrap().len(), 1);
    }
}
