//! Guarding and publishing build outputs.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// RAII guard: an exclusive advisory lock on `<output>.lock`.
///
/// The lock is released on drop. The file itself stays behind: unlinking it
/// would let a waiting build lock an inode no later build can see.
#[derive(Debug)]
pub struct OutputLock {
    _file: File,
}

impl OutputLock {
    pub fn acquire(output: &Path) -> Result<Self> {
        let mut name = output.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::disk_write("image", format!("lock file {}: {}", path.display(), e)))?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::disk_write(
                "image",
                format!("{} is being built by another process", output.display()),
            ));
        }

        Ok(Self { _file: file })
    }
}

/// Fail with [`Error::InsufficientSpace`] if `dir` cannot take `required` bytes.
pub fn ensure_space(dir: &Path, required: u64) -> Result<()> {
    let available = fs2::available_space(dir)
        .map_err(|e| Error::disk_write("image", format!("free space of {}: {}", dir.display(), e)))?;
    if available < required {
        return Err(Error::InsufficientSpace {
            dir: dir.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

/// Serialize `value` as pretty JSON into a temp file next to `dest`.
///
/// Nothing appears under `dest` until [`NamedTempFile::persist`] is called.
pub fn stage_json<T: Serialize>(dest: &Path, value: &T) -> Result<NamedTempFile> {
    let fail = |e: &dyn std::fmt::Display| Error::disk_write("manifest", format!("{}: {}", dest.display(), e));

    let dir = match dest.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| fail(&e))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| fail(&e))?;
    tmp.write_all(b"\n").map_err(|e| fail(&e))?;
    tmp.as_file().sync_all().map_err(|e| fail(&e))?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn second_lock_on_same_output_fails() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("sd.img");

        let first = OutputLock::acquire(&output).unwrap();
        assert!(dir.path().join("sd.img.lock").exists());
        let err = OutputLock::acquire(&output).unwrap_err();
        assert!(err.to_string().contains("another process"));

        drop(first);
        assert!(dir.path().join("sd.img.lock").exists());
        let again = OutputLock::acquire(&output).unwrap();
        assert!(OutputLock::acquire(&output).is_err());
        drop(again);
    }

    #[test]
    fn impossible_space_requirement_fails() {
        let dir = TempDir::new().unwrap();
        ensure_space(dir.path(), 1).unwrap();
        let err = ensure_space(dir.path(), u64::MAX).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { required: u64::MAX, .. }));
    }

    #[test]
    fn staged_json_appears_only_on_persist() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("manifest.json");
        let tmp = stage_json(&dest, &serde_json::json!({ "ok": true })).unwrap();
        assert!(!dest.exists());
        tmp.persist(&dest).unwrap();
        let text = fs::read_to_string(&dest).unwrap();
        assert!(text.contains("\"ok\": true"));
    }
}
