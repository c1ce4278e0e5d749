//! Atomic file writes and lenient line-oriented reads.
//!
//! Every persisted file is written as a sibling temp file
//! (`<name>.tmp.<pid>`) in the same directory, then renamed over the
//! target. Files holding identity material or decrypted history use mode
//! 0600; everything else 0644. Symlink targets are refused.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Result, StoreError};

/// Unix mode applied to a written file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    /// 0600 — identity material, decrypted history, storage key.
    Private,
    /// 0644 — everything else.
    Shared,
}

impl FileMode {
    #[cfg(unix)]
    fn bits(self) -> u32 {
        match self {
            FileMode::Private => 0o600,
            FileMode::Shared => 0o644,
        }
    }
}

#[cfg(unix)]
fn apply_mode(file: &fs::File, mode: FileMode) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode.bits()))
}

#[cfg(not(unix))]
fn apply_mode(_file: &fs::File, _mode: FileMode) -> std::io::Result<()> {
    Ok(())
}

/// Fail if `path` exists and is a symlink.
pub fn refuse_symlink(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(StoreError::Symlink(path.to_path_buf()))
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Fail unless `path`, lexically normalized, stays inside `root`.
pub fn ensure_within_root(root: &Path, path: &Path) -> Result<()> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(StoreError::PathOutsideRoot(path.to_path_buf()));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if normalized.starts_with(root) {
        Ok(())
    } else {
        Err(StoreError::PathOutsideRoot(path.to_path_buf()))
    }
}

/// Require owner-only permissions on an existing file.
#[cfg(unix)]
pub fn require_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    if meta.permissions().mode() & 0o077 != 0 {
        return Err(StoreError::UnsafePermissions(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn require_private(_path: &Path) -> Result<()> {
    Ok(())
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: FileMode) -> Result<()> {
    refuse_symlink(path)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::PathOutsideRoot(path.to_path_buf()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp.{}", std::process::id()));

    let result = (|| -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        apply_mode(&file, mode)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T, mode: FileMode) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    write_atomic(path, &json, mode)
}

/// Read and parse a JSON file; a missing file is `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    refuse_symlink(path)?;
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Append one line to a JSON-lines file, creating it with `mode`.
pub fn append_line(path: &Path, line: &str, mode: FileMode) -> Result<()> {
    refuse_symlink(path)?;
    let mut file = fs::OpenOptions::new().append(true).create(true).open(path)?;
    apply_mode(&file, mode)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Read the raw lines of a file; a missing file is empty. Blank lines are
/// skipped; a partial last line is returned as-is for the caller's parser
/// to reject.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    refuse_symlink(path)?;
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// Read a JSON-lines file, skipping lines that fail to parse.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let lines = read_lines(path)?;
    let mut records = Vec::with_capacity(lines.len());
    for line in &lines {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping invalid line");
            }
        }
    }
    Ok(records)
}

/// Replace a JSON-lines file wholesale with the given records.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T], mode: FileMode) -> Result<()> {
    let mut out = String::new();
    for record in records {
        let line =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    write_atomic(path, out.as_bytes(), mode)
}

/// Truncate a file to zero length, leaving it in place.
pub fn truncate(path: &Path) -> Result<()> {
    refuse_symlink(path)?;
    match fs::OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        n: u32,
    }

    #[test]
    fn test_write_read_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_json(&path, &Record { n: 7 }, FileMode::Shared).expect("write");
        let back: Option<Record> = read_json(&path).expect("read");
        assert_eq!(back, Some(Record { n: 7 }));
    }

    #[test]
    fn test_missing_json_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let back: Option<Record> = read_json(&dir.path().join("absent.json")).expect("read");
        assert_eq!(back, None);
    }

    #[test]
    fn test_no_temp_residue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_json(&path, &Record { n: 1 }, FileMode::Shared).expect("write");
        let names: Vec<String> = fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_private_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity.json");
        write_json(&path, &Record { n: 1 }, FileMode::Private).expect("write");
        let mode = fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        require_private(&path).expect("private");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("real.json");
        fs::write(&target, b"{}").expect("write");
        let link = dir.path().join("link.json");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        assert!(matches!(
            write_json(&link, &Record { n: 1 }, FileMode::Shared),
            Err(StoreError::Symlink(_))
        ));
        assert!(matches!(
            read_json::<Record>(&link),
            Err(StoreError::Symlink(_))
        ));
    }

    #[test]
    fn test_path_containment() {
        let root = Path::new("/data/agent");
        ensure_within_root(root, &root.join("group_history/abc.jsonl")).expect("inside");
        assert!(ensure_within_root(root, &root.join("../outside.jsonl")).is_err());
        assert!(ensure_within_root(root, Path::new("/etc/passwd")).is_err());
        assert!(ensure_within_root(root, &root.join("a/../../b")).is_err());
    }

    #[test]
    fn test_jsonl_skips_bad_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.jsonl");
        append_line(&path, r#"{"n":1}"#, FileMode::Shared).expect("append");
        append_line(&path, "not json at all", FileMode::Shared).expect("append");
        append_line(&path, r#"{"n":2}"#, FileMode::Shared).expect("append");
        // Partial last line without newline
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(br#"{"n":3"#))
            .expect("partial");

        let records: Vec<Record> = read_jsonl(&path).expect("read");
        assert_eq!(records, vec![Record { n: 1 }, Record { n: 2 }]);
    }

    #[test]
    fn test_write_jsonl_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.jsonl");
        write_jsonl(&path, &[Record { n: 1 }, Record { n: 2 }], FileMode::Shared)
            .expect("write");
        write_jsonl(&path, &[Record { n: 9 }], FileMode::Shared).expect("rewrite");
        let records: Vec<Record> = read_jsonl(&path).expect("read");
        assert_eq!(records, vec![Record { n: 9 }]);
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("commands.jsonl");
        append_line(&path, r#"{"n":1}"#, FileMode::Shared).expect("append");
        truncate(&path).expect("truncate");
        assert_eq!(read_lines(&path).expect("read").len(), 0);
        // Truncating a missing file is fine
        truncate(&dir.path().join("absent.jsonl")).expect("truncate");
    }
}
