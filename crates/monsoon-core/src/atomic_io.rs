use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

/// Writes text using a temp file + rename so readers never observe partial data.
///
/// Missing parent directories are created. The rename is atomic on the
/// filesystems the collector targets, which is what lets the backlog journal
/// be snapshotted while a reader may be tailing it.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let file_name = match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => name,
        None => bail!("destination path '{}' has no file name", path.display()),
    };
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_path = parent_dir.join(format!(
        ".{file_name}.{}-{}.tmp",
        std::process::id(),
        current_unix_timestamp_ms()
    ));
    let mut temp_file = std::fs::File::create(&temp_path)
        .with_context(|| format!("failed to create {}", temp_path.display()))?;
    temp_file
        .write_all(content.as_bytes())
        .and_then(|_| temp_file.flush())
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    drop(temp_file);
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}
