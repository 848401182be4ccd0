//! Filesystem collaborator: enumerating submissions, packaging directory
//! trees as `(relative path, base64)` pairs, and persisting results.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{GridError, Result};

/// Names of the immediate subdirectories of `dir`, sorted for deterministic
/// dispatch order. Non-directory entries are ignored.
pub fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Read every file under `dir` (recursively) as an ordered list of
/// `(path relative to dir, base64 payload)` pairs.
pub fn read_dir_files(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    walk(dir, dir, &mut entries)?;
    entries.sort();
    Ok(entries)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|_| GridError::Io(std::io::Error::other("path outside crawl root")))?
                .to_string_lossy()
                .into_owned();
            let bytes = fs::read(&path)?;
            out.push((relative, base64::encode(&bytes)));
        }
    }
    Ok(())
}

/// Decode and write a list of file payloads under `dir`, creating parent
/// directories as needed. Paths that escape `dir` (absolute or containing
/// `..`) are rejected.
pub fn materialize(dir: &Path, entries: &[(String, String)]) -> Result<()> {
    for (relative, payload) in entries {
        let relative = Path::new(relative);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(GridError::Protocol(format!(
                "refusing to materialize unsafe path {}",
                relative.display()
            )));
        }

        let bytes = base64::decode(payload)
            .map_err(|e| GridError::Protocol(format!("bad base64 file payload: {e}")))?;

        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, bytes)?;
    }
    Ok(())
}

/// Persist one result transcript as `<dir>/<key>.txt`, creating `dir` if
/// missing. Returns the written path.
pub fn write_result(dir: &Path, key: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{key}.txt"));
    fs::write(&path, bytes)?;
    Ok(path)
}

/// An assignment key must be a single plain path component; anything else
/// could address files outside the directories it names.
pub fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains('/')
        && !key.contains('\\')
}
