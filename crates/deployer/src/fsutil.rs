//! Filesystem helpers for crash-safe writes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

/// Sibling path used to stage a replacement for `path`
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()))
}

/// Sibling path holding the previous version of `path`
pub fn prev_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".prev");
    PathBuf::from(name)
}

/// Write `contents` to a staged sibling and fsync it. Returns the staged path.
pub fn write_staged(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let staged = temp_sibling(path);
    let mut file = File::create(&staged)?;
    file.write_all(contents)?;
    file.sync_all()?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staged, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(staged)
}

/// Replace `path` with `contents` via write-temp-then-rename.
///
/// Readers observe either the old or the new file, never a partial write.
pub fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let staged = write_staged(path, contents, mode)?;
    if let Err(e) = fs::rename(&staged, path) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    trace!(path = %path.display(), bytes = contents.len(), "Wrote file atomically");
    Ok(())
}

/// Copy `path` to its `.prev` sibling if it exists. Returns whether a copy was made.
pub fn keep_previous(path: &Path) -> io::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let contents = fs::read(path)?;
    write_atomic(&prev_path(path), &contents, None)?;
    Ok(true)
}
