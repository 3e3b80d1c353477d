//! Advisory locks guarding output paths.
//!
//! Two processes wanting to produce the same store path serialize on a
//! sibling `.lock` file. Lock files outlive their holders, so after
//! acquisition the caller must re-check whether the path has become
//! valid in the meantime and reuse the result if so.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::{flock, FlockArg};

use crate::error::{Error, Result};

/// How often a blocked acquisition wakes up to poll for interruption.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct PathLocks {
    held: Vec<(PathBuf, File)>,
    delete_on_release: bool,
}

fn lock_file_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

impl PathLocks {
    pub fn new() -> Self {
        PathLocks {
            held: Vec::new(),
            delete_on_release: false,
        }
    }

    /// Acquire locks on all of `paths`, sorted to avoid deadlocks
    /// between processes locking overlapping sets. Blocks, but polls
    /// `interrupted` between attempts.
    pub fn lock<'a>(
        &mut self,
        paths: impl IntoIterator<Item = &'a Path>,
        interrupted: impl Fn() -> bool,
    ) -> Result<()> {
        let mut paths: Vec<&Path> = paths.into_iter().collect();
        paths.sort();
        paths.dedup();

        for path in paths {
            let lock_path = lock_file_for(path);
            loop {
                if interrupted() {
                    return Err(Error::Interrupted);
                }

                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&lock_path)?;

                match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                    Ok(()) => {}
                    Err(nix::errno::Errno::EWOULDBLOCK) => {
                        std::thread::sleep(POLL_INTERVAL);
                        continue;
                    }
                    Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32).into()),
                }

                // The lock file may have been deleted and re-created by
                // the previous holder between our open and our flock;
                // in that case we hold a lock on a dead inode. Retry.
                let on_disk = std::fs::metadata(&lock_path);
                let ours = file.metadata()?;
                match on_disk {
                    Ok(m) if same_file(&m, &ours) => {
                        self.held.push((lock_path, file));
                        break;
                    }
                    _ => continue,
                }
            }
        }

        Ok(())
    }

    /// Delete the lock files when releasing. Done once the guarded
    /// path is registered valid: future lockers will see validity
    /// before ever creating a lock file with the same name.
    pub fn set_deletion(&mut self, delete: bool) {
        self.delete_on_release = delete;
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PathLocks {
    fn drop(&mut self) {
        for (path, file) in self.held.drain(..) {
            if self.delete_on_release {
                let _ = std::fs::remove_file(&path);
            }
            drop(file);
        }
    }
}

fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}
