use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::warn;

use s3fuse_base::error::{Error, Result};

/// Reads a file that holds secret material.
///
/// The file must be a regular file with mode exactly 0600; anything looser
/// is refused so the daemon never runs with world-readable credentials.
pub fn read(path: &Path) -> Result<String> {
    let metadata = std::fs::metadata(path)?;
    let mode = metadata.permissions().mode() & 0o7777;

    if !metadata.is_file() || mode != 0o600 {
        warn!("refusing secret file {} with mode {:o}", path.display(), mode);
        return Err(Error::Denied);
    }

    Ok(std::fs::read_to_string(path)?)
}
