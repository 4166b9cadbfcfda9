//! Working directory provisioning.
//!
//! Tor refuses to use a data directory that other users can read, so every
//! directory handed to it is created owner-only.

use std::fs;
use std::io;
use std::path::Path;

/// Ensure `path` exists as a directory with owner-only permissions.
///
/// A file (or anything else that is not a directory) at `path` is removed
/// first and replaced by a fresh directory.
pub fn ensure_private_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    log_directory_diagnostics(path);

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            tracing::debug!("Replacing non-directory at {}", path.display());
            fs::remove_file(path)?;
            create_dir(path)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_dir(path)?,
        Err(e) => return Err(e),
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

fn create_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("Failed to create directory '{}': {}", path.display(), e),
        )
    })
}

/// Log ownership details to help debug permission problems in containers.
#[cfg(unix)]
fn log_directory_diagnostics(path: &Path) {
    use std::os::unix::fs::MetadataExt;
    let uid = unsafe { libc::getuid() };

    match fs::metadata(path) {
        Ok(meta) => tracing::debug!(
            "{}: owner={}:{}, mode={:o}, is_dir={}, running as uid={}",
            path.display(),
            meta.uid(),
            meta.gid(),
            meta.mode() & 0o7777,
            meta.is_dir(),
            uid
        ),
        Err(_) => tracing::debug!(
            "{} does not exist, creating (uid={})",
            path.display(),
            uid
        ),
    }
}
