//! Cross-process advisory lock.
//!
//! Acquisition is `mkdir(lock.d)` — atomic on every platform we target.
//! The holder records its PID in `lock.d/pid`; a contender finding the
//! directory present probes that PID and reclaims the lock when the holder
//! is dead. Release removes the directory only when the recorded PID is
//! our own.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{Result, StoreError};

/// Default total wait for acquisition.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Poll interval while contending.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Whether a PID names a live process.
///
/// `kill(pid, 0)` probes existence; `EPERM` still means alive.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// RAII guard for the directory lock. Dropping releases.
#[derive(Debug)]
pub struct LockGuard {
    dir: PathBuf,
}

impl LockGuard {
    /// Acquire the lock at `dir` within the default timeout.
    pub fn acquire(dir: &Path) -> Result<Self> {
        Self::acquire_timeout(dir, DEFAULT_TIMEOUT)
    }

    /// Acquire the lock at `dir`, waiting at most `timeout`.
    pub fn acquire_timeout(dir: &Path, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            match fs::create_dir(dir) {
                Ok(()) => {
                    let pid_path = dir.join("pid");
                    fs::write(&pid_path, std::process::id().to_string())?;
                    return Ok(Self {
                        dir: dir.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::reclaim_if_stale(dir)? {
                        continue;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Parent directory missing; nothing to wait for.
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= timeout {
                return Err(StoreError::LockTimeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Remove a lock whose recorded holder is dead. Returns true when the
    /// caller should immediately retry acquisition.
    fn reclaim_if_stale(dir: &Path) -> Result<bool> {
        let holder = fs::read_to_string(dir.join("pid"))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        match holder {
            Some(pid) if pid_alive(pid) => Ok(false),
            // Dead holder, unreadable pid file, or a half-created lock:
            // tear it down and retry. A racing remove is fine.
            _ => {
                let _ = fs::remove_dir_all(dir);
                Ok(true)
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let ours = fs::read_to_string(self.dir.join("pid"))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            == Some(std::process::id());
        if ours {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// Run `f` under the lock at `dir`, releasing on every exit path.
pub fn with_lock<T>(dir: &Path, timeout: Duration, f: impl FnOnce() -> T) -> Result<T> {
    let guard = LockGuard::acquire_timeout(dir, timeout)?;
    let value = f();
    drop(guard);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_dir = dir.path().join(".lock.d");
        {
            let _guard = LockGuard::acquire(&lock_dir).expect("acquire");
            assert!(lock_dir.is_dir());
        }
        assert!(!lock_dir.exists());
    }

    #[test]
    fn test_exclusion_while_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_dir = dir.path().join(".lock.d");
        let _guard = LockGuard::acquire(&lock_dir).expect("acquire");

        let err = LockGuard::acquire_timeout(&lock_dir, Duration::from_millis(50))
            .expect_err("second acquire must time out");
        assert!(matches!(err, StoreError::LockTimeout(_)));
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_dir = dir.path().join(".lock.d");
        fs::create_dir(&lock_dir).expect("mkdir");
        // PID 0 is never a live holder.
        fs::write(lock_dir.join("pid"), "0").expect("write");

        let _guard = LockGuard::acquire(&lock_dir).expect("reclaim stale");
    }

    #[test]
    fn test_lock_without_pid_file_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_dir = dir.path().join(".lock.d");
        fs::create_dir(&lock_dir).expect("mkdir");

        let _guard = LockGuard::acquire(&lock_dir).expect("reclaim half-created");
    }

    #[test]
    fn test_with_lock_releases_on_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_dir = dir.path().join(".lock.d");
        let value = with_lock(&lock_dir, DEFAULT_TIMEOUT, || 42).expect("with_lock");
        assert_eq!(value, 42);
        assert!(!lock_dir.exists());
    }

    #[test]
    fn test_sequential_reacquire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_dir = dir.path().join(".lock.d");
        for _ in 0..5 {
            let guard = LockGuard::acquire(&lock_dir).expect("acquire");
            drop(guard);
        }
        assert!(!lock_dir.exists());
    }

    #[test]
    fn test_threaded_exclusion() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().expect("tempdir");
        let lock_dir = dir.path().join(".lock.d");
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock_dir = lock_dir.clone();
                let concurrent = concurrent.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let result =
                            with_lock(&lock_dir, Duration::from_secs(10), || {
                                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                std::thread::sleep(Duration::from_micros(200));
                                concurrent.fetch_sub(1, Ordering::SeqCst);
                            });
                        result.expect("lock under contention");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
