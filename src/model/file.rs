//! Document file I/O.
//!
//! Write-back must never leave the operator with a half-written file, so
//! saves go through a temp file + fsync + rename.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Read a document file into memory.
///
/// # Errors
///
/// Returns `Error::DocumentNotFound` if the path does not exist, or an I/O
/// error if it cannot be read.
pub fn read_document(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(Error::DocumentNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(fs::read_to_string(path)?)
}

/// Write content to a file atomically.
///
/// 1. Writes content to a sibling temp file (`<name>.tmp`)
/// 2. Calls `fsync` so the data is on disk
/// 3. Renames the temp file over the target path
///
/// If any step fails, the original file (if any) remains untouched.
///
/// # Errors
///
/// Returns an error if any file operation fails.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let mut temp_name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .ok_or_else(|| Error::InvalidArgument(format!("not a file path: {}", path.display())))?;
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(content.as_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    Ok(())
}
