//! Stage workspace management.
//!
//! A [`Bundle`] is the private workspace of one build stage: the directory
//! that will become the container's `/` plus a scratch directory for
//! session files and packer intermediates. Bundles are created by the
//! orchestrator, populated through the stage run and removed on cleanup
//! unless the user asked to keep them.

use crate::error::{Result, VesselError};
use crate::recipe::Definition;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Descriptor id under which the inspect summary is embedded in image-file
/// output.
pub const DESC_INSPECT_METADATA_JSON: &str = "inspect-metadata-json";

/// Key handle for an encrypted filesystem descriptor. Validation of the key
/// material happens before the build is constructed.
#[derive(Clone)]
pub struct EncryptionKeyInfo {
    pub material: Vec<u8>,
}

impl fmt::Debug for EncryptionKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKeyInfo(..)")
    }
}

/// Opaque handle to the image cache backend. The engine only requires it to
/// be present for builds that bootstrap from remote sources.
#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Build options threaded through bundles, stages and assemblers.
#[derive(Debug, Clone)]
pub struct Options {
    /// Build into an existing sandbox instead of bootstrapping.
    pub update: bool,
    /// Overwrite existing metadata and, combined with `update`, re-bootstrap.
    pub force: bool,
    /// Parent directory for temporary build state.
    pub tmp_dir: PathBuf,
    /// User bind specs (`src[:dst[:opts]]`) honored during post/test.
    pub binds: Vec<String>,
    /// Keep bundles on disk after the build for debugging.
    pub no_clean_up: bool,
    /// `all`, `none`, or a whitelist of section names to run.
    pub sections: Vec<String>,
    /// Architecture the build targets, for the build-arch label.
    pub arch: String,
    /// Base image tag, recorded as an OCI label when set with `digest`.
    pub tag: String,
    /// Base image digest, recorded as an OCI label when set with `tag`.
    pub digest: String,
    pub encryption_key_info: Option<EncryptionKeyInfo>,
    pub image_cache: Option<ImageCache>,
    /// Extra arguments for the external squashfs packager.
    pub mksquashfs_args: Vec<String>,
    /// Build without privilege; enables the FUSE image drivers.
    pub unprivilege: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            update: false,
            force: false,
            tmp_dir: std::env::temp_dir(),
            binds: Vec::new(),
            no_clean_up: false,
            sections: vec!["all".to_string()],
            arch: std::env::consts::ARCH.to_string(),
            tag: String::new(),
            digest: String::new(),
            encryption_key_info: None,
            image_cache: None,
            mksquashfs_args: Vec::new(),
            unprivilege: false,
        }
    }
}

/// A stage's workspace: rootfs plus scratch directory.
#[derive(Debug)]
pub struct Bundle {
    /// Directory that will become the container's `/`.
    pub rootfs_path: PathBuf,
    /// Scratch space for session files and packer intermediates.
    pub tmp_dir: PathBuf,
    /// The stage's parsed recipe.
    pub recipe: Definition,
    pub opts: Options,
    /// Metadata descriptors to embed into image-file output, by id.
    pub json_objects: HashMap<String, Vec<u8>>,
    /// The caller-chosen parent the rootfs was requested under.
    pub parent_path: PathBuf,
}

impl Bundle {
    /// Create a bundle with its rootfs under `parent_path` and scratch space
    /// under `tmp_parent`.
    ///
    /// If the filesystem under `parent_path` does not support ownership
    /// changes the rootfs is relocated into the scratch directory; the
    /// orchestrator detects this through [`Bundle::rootfs_relocated`] and
    /// switches the sandbox assembler to copy mode.
    pub fn new(parent_path: &Path, tmp_parent: &Path) -> Result<Self> {
        let tmp_dir = unique_dir(tmp_parent, "bundle-temp-")?;
        let mut rootfs_path = parent_path.join("rootfs");
        std::fs::create_dir_all(&rootfs_path).map_err(|e| VesselError::io(&rootfs_path, e))?;

        if !supports_ownership(&rootfs_path) {
            let relocated = tmp_dir.join("rootfs");
            std::fs::create_dir_all(&relocated).map_err(|e| VesselError::io(&relocated, e))?;
            let _ = std::fs::remove_dir(&rootfs_path);
            debug!(
                "rootfs relocated from {:?} to {:?}: no ownership support",
                rootfs_path, relocated
            );
            rootfs_path = relocated;
        }

        Ok(Self {
            rootfs_path,
            tmp_dir,
            recipe: Definition::default(),
            opts: Options::default(),
            json_objects: HashMap::new(),
            parent_path: parent_path.to_path_buf(),
        })
    }

    /// Whether the rootfs ended up outside the caller-chosen parent.
    pub fn rootfs_relocated(&self) -> bool {
        !self.rootfs_path.starts_with(&self.parent_path)
    }

    /// Whether the named section should run under the `sections` option.
    pub fn run_section(&self, name: &str) -> bool {
        let sections = &self.opts.sections;
        if sections.len() == 1 {
            match sections[0].as_str() {
                "all" => return true,
                "none" => return false,
                _ => {}
            }
        }
        if sections.is_empty() {
            return true;
        }
        sections.iter().any(|s| s == name)
    }

    /// Best-effort removal of the bundle's directories. Idempotent: a bundle
    /// that is already gone is not an error.
    pub fn remove(&self) -> Result<()> {
        for dir in [&self.rootfs_path, &self.tmp_dir] {
            debug!("removing bundle path {:?}", dir);
            if let Err(err) = std::fs::remove_dir_all(dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(VesselError::io(dir, err));
                }
            }
        }
        // The parent build directory is empty once the rootfs is gone.
        let _ = std::fs::remove_dir(&self.parent_path);
        Ok(())
    }
}

/// Create a uniquely named directory under `parent`.
pub fn unique_dir(parent: &Path, prefix: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(parent).map_err(|e| VesselError::io(parent, e))?;
    let dir = parent.join(format!("{prefix}{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir(&dir).map_err(|e| VesselError::io(&dir, e))?;
    Ok(dir)
}

// Probe whether the filesystem below `dir` honors chown at all. Identity
// chown fails on filesystems that reject ownership changes outright.
fn supports_ownership(dir: &Path) -> bool {
    let probe = dir.join(".ownership-probe");
    if std::fs::write(&probe, b"").is_err() {
        return false;
    }
    let supported = {
        let cpath = match std::ffi::CString::new(probe.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        unsafe { libc::chown(cpath.as_ptr(), uid, gid) == 0 }
    };
    let _ = std::fs::remove_file(&probe);
    if !supported {
        warn!("filesystem under {:?} does not support ownership changes", dir);
    }
    supported
}
