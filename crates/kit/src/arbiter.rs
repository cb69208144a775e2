//! Cross-process refcounted resource lifecycle
//!
//! Brings a shared host resource up exactly once for the first process
//! that needs it and down again when the last user is done, coordinated
//! purely through an advisory lock file. The first one into the room
//! turns the lights on; the last one out turns them off.
//!
//! The exclusive lock acts as a momentary gate: whichever process wins
//! the non-blocking exclusive attempt runs `on_up`, then downgrades to a
//! shared lock. Late arrivals fail the exclusive attempt and block on
//! the shared lock instead, joining without re-running `on_up`. A
//! successful non-blocking re-upgrade during release means no other
//! shared holder remains, so that process runs `on_down`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use color_eyre::Result;
use rustix::fs::{flock, FlockOperation};
use rustix::io::Errno;
use thiserror::Error;
use tracing::debug;

/// Lock-layer failure; hook errors propagate as-is.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("cannot create lock directory {path}: {source}")]
    LockDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot lock resource {class}/{name}: {source}")]
    Lock {
        class: String,
        name: String,
        source: std::io::Error,
    },
}

/// A host-level resource shared between unrelated processes.
///
/// Resources with the same class and name are considered the same
/// resource by the locking and refcounting mechanism.
pub trait Resource {
    fn class(&self) -> &'static str;
    fn name(&self) -> &str;

    /// Bring the resource up. Runs once per group of processes.
    fn on_up(&self) -> Result<()>;
    /// Tear the resource down. Runs once, by the last holder.
    fn on_down(&self) -> Result<()>;
    /// Start using the resource. Runs once per holder.
    fn on_acquire(&self) -> Result<()>;
    /// Stop using the resource. Runs once per holder.
    fn on_release(&self) -> Result<()>;
}

/// Directory holding the lock file (and any per-resource state such as
/// a helper pidfile) for the given resource identity.
pub fn lock_dir(run_dir: &Path, class: &str, name: &str) -> PathBuf {
    run_dir.join("resources").join(class).join(name)
}

/// Default run directory: `/run/vmkit` for root, a tmpdir otherwise so
/// unprivileged invocations (and the tests) still work.
pub fn default_run_dir() -> PathBuf {
    if rustix::process::geteuid().is_root() {
        PathBuf::from("/run/vmkit")
    } else {
        std::env::temp_dir().join("vmkit")
    }
}

fn lock_err<R: Resource + ?Sized>(resource: &R, errno: Errno) -> color_eyre::Report {
    ResourceError::Lock {
        class: resource.class().to_string(),
        name: resource.name().to_string(),
        source: errno.into(),
    }
    .into()
}

/// Run `body` while holding `resource`, with exactly-once up/down
/// semantics across all concurrent holders of the same identity.
///
/// Teardown runs on every exit path; an error from a hook or from
/// `body` propagates only after the locks are dropped and the lock file
/// removed.
pub fn with_resource<R: Resource + ?Sized, T>(
    run_dir: &Path,
    resource: &R,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let dir = lock_dir(run_dir, resource.class(), resource.name());
    fs::create_dir_all(&dir).map_err(|e| ResourceError::LockDir {
        path: dir.clone(),
        source: e,
    })?;
    let lock_path = dir.join("lock");
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&lock_path)
        .map_err(|e| ResourceError::LockDir {
            path: lock_path.clone(),
            source: e,
        })?;
    debug!("using resource lock {}", lock_path.display());

    let result = (|| {
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            // We won the gate: bring the resource up, then downgrade so
            // other processes may join as shared holders.
            Ok(()) => resource.on_up()?,
            Err(Errno::WOULDBLOCK) => {}
            Err(e) => return Err(lock_err(resource, e)),
        }
        flock(&file, FlockOperation::LockShared).map_err(|e| lock_err(resource, e))?;
        resource.on_acquire()?;
        body()
    })();

    let mut teardown: Result<()> = Ok(());
    if let Err(e) = resource.on_release() {
        teardown = Err(e);
    }
    // A successful upgrade means we are the last shared holder.
    if flock(&file, FlockOperation::NonBlockingLockExclusive).is_ok() {
        if let Err(e) = resource.on_down() {
            if teardown.is_ok() {
                teardown = Err(e);
            }
        }
    }
    let _ = flock(&file, FlockOperation::Unlock);
    // Known limitation carried over from the original design: unlinking
    // here while another process is between open() and flock() lets it
    // recreate the path with a fresh inode, splitting the refcount
    // group into two. Holders of the unlinked inode still behave
    // correctly among themselves.
    let _ = fs::remove_file(&lock_path);

    match result {
        Ok(v) => teardown.map(|()| v),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use color_eyre::eyre::eyre;
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct Counters {
        ups: AtomicUsize,
        downs: AtomicUsize,
        acquires: AtomicUsize,
        releases: AtomicUsize,
    }

    struct TestResource<'a> {
        counters: &'a Counters,
        fail_acquire: bool,
    }

    impl Resource for TestResource<'_> {
        fn class(&self) -> &'static str {
            "test"
        }

        fn name(&self) -> &str {
            "shared"
        }

        fn on_up(&self) -> Result<()> {
            self.counters.ups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_down(&self) -> Result<()> {
            self.counters.downs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_acquire(&self) -> Result<()> {
            self.counters.acquires.fetch_add(1, Ordering::SeqCst);
            if self.fail_acquire {
                return Err(eyre!("acquire refused"));
            }
            Ok(())
        }

        fn on_release(&self) -> Result<()> {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_holders_single_up_down() {
        const HOLDERS: usize = 8;
        let run_dir = TempDir::new().unwrap();
        let counters = Counters::default();
        // All holders overlap before any releases, so the group must
        // see exactly one on_up and one on_down in total.
        let barrier = Barrier::new(HOLDERS);

        std::thread::scope(|s| {
            for _ in 0..HOLDERS {
                s.spawn(|| {
                    let resource = TestResource {
                        counters: &counters,
                        fail_acquire: false,
                    };
                    with_resource(run_dir.path(), &resource, || {
                        barrier.wait();
                        Ok(())
                    })
                    .unwrap();
                });
            }
        });

        assert_eq!(counters.ups.load(Ordering::SeqCst), 1);
        assert_eq!(counters.downs.load(Ordering::SeqCst), 1);
        assert_eq!(counters.acquires.load(Ordering::SeqCst), HOLDERS);
        assert_eq!(counters.releases.load(Ordering::SeqCst), HOLDERS);
    }

    #[test]
    fn test_sequential_groups_cycle_up_down() {
        let run_dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let resource = TestResource {
            counters: &counters,
            fail_acquire: false,
        };

        for _ in 0..3 {
            with_resource(run_dir.path(), &resource, || Ok(())).unwrap();
        }

        // Disjoint holder groups each get their own lifecycle.
        assert_eq!(counters.ups.load(Ordering::SeqCst), 3);
        assert_eq!(counters.downs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_body_error_still_releases() {
        let run_dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let resource = TestResource {
            counters: &counters,
            fail_acquire: false,
        };

        let err = with_resource(run_dir.path(), &resource, || -> Result<()> {
            Err(eyre!("body exploded"))
        })
        .unwrap_err();
        assert!(err.to_string().contains("body exploded"));
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counters.downs.load(Ordering::SeqCst), 1);
        // The lock file is removed even on the error path.
        assert!(!lock_dir(run_dir.path(), "test", "shared")
            .join("lock")
            .exists());
    }

    #[test]
    fn test_hook_error_propagates_after_cleanup() {
        let run_dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let resource = TestResource {
            counters: &counters,
            fail_acquire: true,
        };

        let err = with_resource(run_dir.path(), &resource, || Ok(())).unwrap_err();
        assert!(err.to_string().contains("acquire refused"));
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }
}
