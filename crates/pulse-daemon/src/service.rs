//! Service control: one detached worker per data directory.
//!
//! The PID file is the liveness record. `start` spawns this same binary
//! detached with null stdio and polls the PID file for readiness; `stop`
//! sends SIGTERM and waits briefly for the PID to die.

use std::time::{Duration, Instant};

use tracing::info;

use pulse_store::lock::pid_alive;
use pulse_store::paths::DataDir;

use crate::{Result, WorkerError};

/// How long `start` waits for the worker to write its PID file.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop` waits for the worker to exit after SIGTERM.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

const POLL: Duration = Duration::from_millis(100);

/// The PID recorded in the data directory, if any.
pub fn read_pid(data: &DataDir) -> Option<u32> {
    std::fs::read_to_string(data.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Whether a live worker owns this data directory.
pub fn is_running(data: &DataDir) -> bool {
    read_pid(data).is_some_and(pid_alive)
}

/// Claim the PID file for this process. Fails when a live worker already
/// holds it; a stale record from a dead worker is replaced.
pub fn claim_pid_file(data: &DataDir) -> Result<()> {
    if let Some(pid) = read_pid(data) {
        if pid_alive(pid) && pid != std::process::id() {
            return Err(WorkerError::AlreadyRunning(pid));
        }
    }
    std::fs::write(data.pid_file(), std::process::id().to_string())?;
    Ok(())
}

/// Remove the PID file if it records this process.
pub fn release_pid_file(data: &DataDir) {
    if read_pid(data) == Some(std::process::id()) {
        let _ = std::fs::remove_file(data.pid_file());
    }
}

/// Spawn a detached worker (`<this binary> run`) and wait for readiness.
pub fn start(data: &DataDir, ephemeral: bool) -> Result<u32> {
    if let Some(pid) = read_pid(data) {
        if pid_alive(pid) {
            return Err(WorkerError::AlreadyRunning(pid));
        }
    }

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("run")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if ephemeral {
        command.arg("--ephemeral");
    }
    command.env(pulse_store::paths::DATA_DIR_ENV, data.root());

    let child = command
        .spawn()
        .map_err(|e| WorkerError::StartFailed(e.to_string()))?;
    let child_pid = child.id();

    // The worker writes its PID file once its components are up.
    let deadline = Instant::now() + START_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(pid) = read_pid(data) {
            if pid_alive(pid) {
                info!(pid, "worker started");
                return Ok(pid);
            }
        }
        if !pid_alive(child_pid) {
            return Err(WorkerError::StartFailed(
                "worker exited before becoming ready".to_string(),
            ));
        }
        std::thread::sleep(POLL);
    }
    Err(WorkerError::StartFailed(
        "worker did not become ready in time".to_string(),
    ))
}

/// SIGTERM the recorded worker and wait for it to exit.
pub fn stop(data: &DataDir) -> Result<()> {
    let pid = read_pid(data).ok_or(WorkerError::NotRunning)?;
    if !pid_alive(pid) {
        // Stale record; clean it up.
        let _ = std::fs::remove_file(data.pid_file());
        return Err(WorkerError::NotRunning);
    }

    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(WorkerError::StopFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
    }
    #[cfg(not(unix))]
    {
        return Err(WorkerError::StopFailed(
            "signal delivery unsupported on this platform".to_string(),
        ));
    }

    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            info!(pid, "worker stopped");
            return Ok(());
        }
        std::thread::sleep(POLL);
    }
    Err(WorkerError::StopFailed(format!(
        "pid {pid} still alive after {STOP_TIMEOUT:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());

        assert_eq!(read_pid(&data), None);
        assert!(!is_running(&data));

        claim_pid_file(&data).expect("claim");
        assert_eq!(read_pid(&data), Some(std::process::id()));
        assert!(is_running(&data));

        // Claiming again from the same process is fine
        claim_pid_file(&data).expect("reclaim");

        release_pid_file(&data);
        assert_eq!(read_pid(&data), None);
    }

    #[test]
    fn test_stale_pid_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        // PID 0 is never alive
        std::fs::write(data.pid_file(), "0").expect("write");
        claim_pid_file(&data).expect("claim over stale");
        assert_eq!(read_pid(&data), Some(std::process::id()));
    }

    #[test]
    fn test_release_respects_other_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        std::fs::write(data.pid_file(), "1").expect("write");
        release_pid_file(&data);
        // Not ours; left in place
        assert_eq!(read_pid(&data), Some(1));
    }

    #[test]
    fn test_stop_without_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        assert!(matches!(stop(&data), Err(WorkerError::NotRunning)));
    }
}
