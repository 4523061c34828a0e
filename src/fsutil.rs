//! Small filesystem helpers shared across the build pipeline.

use crate::error::{Result, VesselError};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Return an absolute form of `path` without requiring it to exist.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| VesselError::io(path, e))?;
    Ok(cwd.join(path))
}

/// Locate an executable by name on `$PATH`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if let Ok(meta) = candidate.metadata() {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}

/// Recursively copy `src` into `dst`, preserving permissions and, when
/// permitted, ownership. Ownership failures are tolerated: unprivileged
/// builds cannot chown and the sandbox still has to come out usable.
pub fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    let meta = src.symlink_metadata().map_err(|e| VesselError::io(src, e))?;
    let ftype = meta.file_type();

    if ftype.is_symlink() {
        let target = std::fs::read_link(src).map_err(|e| VesselError::io(src, e))?;
        if dst.symlink_metadata().is_ok() {
            std::fs::remove_file(dst).map_err(|e| VesselError::io(dst, e))?;
        }
        std::os::unix::fs::symlink(&target, dst).map_err(|e| VesselError::io(dst, e))?;
        preserve_owner(&meta, dst);
        return Ok(());
    }

    if ftype.is_dir() {
        if !dst.is_dir() {
            std::fs::create_dir_all(dst).map_err(|e| VesselError::io(dst, e))?;
        }
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| VesselError::io(dst, e))?;
        preserve_owner(&meta, dst);
        for entry in std::fs::read_dir(src).map_err(|e| VesselError::io(src, e))? {
            let entry = entry.map_err(|e| VesselError::io(src, e))?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if ftype.is_file() {
        std::fs::copy(src, dst).map_err(|e| VesselError::io(dst, e))?;
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| VesselError::io(dst, e))?;
        preserve_owner(&meta, dst);
        return Ok(());
    }

    // Sockets, fifos and device nodes are not expected in a build bundle.
    debug!("skipping special file {:?}", src);
    Ok(())
}

fn preserve_owner(meta: &std::fs::Metadata, dst: &Path) {
    let cpath = match std::ffi::CString::new(dst.as_os_str().as_encoded_bytes()) {
        Ok(c) => c,
        Err(_) => return,
    };
    let rc = unsafe { libc::lchown(cpath.as_ptr(), meta.uid(), meta.gid()) };
    if rc != 0 {
        debug!("could not preserve ownership of {:?}", dst);
    }
}

/// Scoped umask override; the previous mask is restored on drop.
pub struct UmaskGuard {
    previous: libc::mode_t,
}

impl UmaskGuard {
    /// Set the process umask to `mask` for the lifetime of the guard.
    pub fn set(mask: libc::mode_t) -> Self {
        let previous = unsafe { libc::umask(mask) };
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe { libc::umask(self.previous) };
    }
}
