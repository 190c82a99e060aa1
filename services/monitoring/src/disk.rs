//! Free-space sampling of the data volume

use crate::error::MonitoringResult;
use std::path::Path;

/// Bytes available to this process on the volume holding `path`
///
/// A path that does not exist yet is measured at its nearest existing
/// ancestor.
///
/// # Errors
///
/// Returns an error if no ancestor exists or the filesystem cannot be queried.
pub fn disk_free_bytes(path: &Path) -> MonitoringResult<u64> {
    let mut existing = path;
    while !existing.exists() {
        match existing.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => existing = parent,
            _ => {
                existing = Path::new(".");
                break;
            }
        }
    }
    Ok(fs2::available_space(existing)?)
}
