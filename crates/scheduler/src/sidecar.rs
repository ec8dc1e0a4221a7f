use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Operator-placed marker: never convert this file
pub const SKIP_SUFFIX: &str = ".av1skip";
/// Written after a successful conversion, holds the output fingerprint
pub const DONE_SUFFIX: &str = ".av1done";
/// Human-readable reason for the last failure
pub const WHY_SUFFIX: &str = ".why.txt";

/// Get the path of a sidecar file for a given media file
pub fn sidecar_path(file_path: &Path, suffix: &str) -> PathBuf {
    let mut name = file_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(suffix);
    file_path.with_file_name(name)
}

/// Whether a path is one of our sidecars rather than media
pub fn is_sidecar_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| [SKIP_SUFFIX, DONE_SUFFIX, WHY_SUFFIX].iter().any(|s| n.ends_with(s)))
}

/// Check if a skip marker (.av1skip) exists for a file
pub fn has_skip_marker(file_path: &Path) -> bool {
    sidecar_path(file_path, SKIP_SUFFIX).exists()
}

/// Write a skip marker file
pub fn write_skip_marker(file_path: &Path) -> Result<()> {
    let skip_path = sidecar_path(file_path, SKIP_SUFFIX);
    fs::write(&skip_path, "")
        .with_context(|| format!("Failed to write skip marker: {}", skip_path.display()))?;
    Ok(())
}

/// Fingerprint recorded by the last successful conversion, if any
pub fn read_done_marker(file_path: &Path) -> Result<Option<String>> {
    let done_path = sidecar_path(file_path, DONE_SUFFIX);
    match fs::read_to_string(&done_path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read done marker: {}", done_path.display())),
    }
}

/// Record that a file is the product of a conversion
pub fn write_done_marker(file_path: &Path, fingerprint: &str) -> Result<()> {
    let done_path = sidecar_path(file_path, DONE_SUFFIX);
    fs::write(&done_path, fingerprint)
        .with_context(|| format!("Failed to write done marker: {}", done_path.display()))?;
    Ok(())
}

/// Write a why.txt file explaining why a file was skipped or failed
pub fn write_why_txt(file_path: &Path, reason: &str) -> Result<()> {
    let why_path = sidecar_path(file_path, WHY_SUFFIX);
    fs::write(&why_path, reason)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}
