//! Final-stage assemblers.
//!
//! The last stage of a build is packaged into one of two output formats: a
//! *sandbox* directory tree, or a single-file image with an embedded
//! squashfs rootfs and metadata descriptors. The sandbox assembler works
//! directly on the filesystem; the image assembler locates the external
//! squashfs packager and hands the write to an [`ImageWriter`].

use crate::bundle::{Bundle, EncryptionKeyInfo};
use crate::error::{Result, VesselError};
use crate::fsutil;
use crate::proc::{self, MountInfoEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Transforms the final bundle into the output artifact.
#[async_trait]
pub trait Assembler: Send {
    async fn assemble(&self, bundle: &Bundle, dest: &Path) -> Result<()>;
}

/// Fail if the filesystem holding `dest` is mounted `noexec`; a sandbox
/// there would not be usable.
pub fn ensure_exec_dest(dest: &Path, entries: &[MountInfoEntry]) -> Result<()> {
    let entry = proc::find_parent_entry(dest, entries)?;
    if entry.options.iter().any(|opt| opt == "noexec") {
        return Err(VesselError::MountInoperable {
            reason: format!(
                "'noexec' mount option set on {}, sandbox {} won't be usable at this location",
                entry.point.display(),
                dest.display()
            ),
        });
    }
    Ok(())
}

/// Assembles the final stage into a sandbox directory.
pub struct SandboxAssembler {
    /// Copy instead of rename. Set when the bundle rootfs lives on a
    /// filesystem that cannot preserve ownership at the destination.
    pub copy: bool,
}

#[async_trait]
impl Assembler for SandboxAssembler {
    async fn assemble(&self, bundle: &Bundle, dest: &Path) -> Result<()> {
        info!("creating sandbox directory...");

        let entries = proc::get_mount_info(proc::SELF_MOUNTINFO)?;
        ensure_exec_dest(dest, &entries)?;

        if dest.exists() {
            debug!("replacing existing destination {:?}", dest);
            std::fs::remove_dir_all(dest).map_err(|e| VesselError::io(dest, e))?;
        }

        if self.copy {
            fsutil::copy_recursive(&bundle.rootfs_path, dest)?;
        } else if let Err(err) = std::fs::rename(&bundle.rootfs_path, dest) {
            // Rename fails across filesystems; fall back to a copy.
            warn!("rename to {:?} failed ({err}), copying instead", dest);
            fsutil::copy_recursive(&bundle.rootfs_path, dest)?;
        }
        Ok(())
    }
}

/// The external squashfs packager the image assembler drives: binary path
/// plus processor and memory limits.
#[derive(Debug, Clone)]
pub struct SquashfsPackager {
    pub path: PathBuf,
    pub procs: u32,
    pub mem: Option<String>,
}

impl SquashfsPackager {
    /// Locate `mksquashfs` and derive its default limits.
    pub fn locate() -> Result<Self> {
        let path = fsutil::find_on_path("mksquashfs").ok_or_else(|| {
            VesselError::UnsupportedOperation {
                operation: "image file assembly".to_string(),
                reason: "mksquashfs not found on PATH".to_string(),
            }
        })?;
        let procs = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Ok(Self { path, procs, mem: None })
    }
}

/// Everything the image writer needs to produce the single-file artifact.
pub struct ImageSpec<'a> {
    pub rootfs: &'a Path,
    /// Metadata descriptors to embed, by descriptor id.
    pub descriptors: &'a HashMap<String, Vec<u8>>,
    pub packager: &'a SquashfsPackager,
    pub extra_args: &'a [String],
    /// When set, the filesystem is wrapped in an encrypted descriptor.
    pub encryption: Option<&'a EncryptionKeyInfo>,
}

/// Writes the single-file image. The concrete writer lives outside the
/// engine next to the signing machinery.
#[async_trait]
pub trait ImageWriter: Send + Sync {
    async fn write_image(&self, spec: &ImageSpec<'_>, dest: &Path) -> Result<()>;
}

/// Placeholder writer for builds that never produce image-file output.
pub struct UnsupportedImageWriter;

#[async_trait]
impl ImageWriter for UnsupportedImageWriter {
    async fn write_image(&self, _spec: &ImageSpec<'_>, dest: &Path) -> Result<()> {
        Err(VesselError::UnsupportedOperation {
            operation: format!("write image {}", dest.display()),
            reason: "no image writer configured".to_string(),
        })
    }
}

/// Assembles the final stage into a single-file image.
pub struct ImageAssembler {
    packager: SquashfsPackager,
    writer: Box<dyn ImageWriter>,
    extra_args: Vec<String>,
}

impl ImageAssembler {
    pub fn new(
        packager: SquashfsPackager,
        writer: Box<dyn ImageWriter>,
        extra_args: Vec<String>,
    ) -> Self {
        Self { packager, writer, extra_args }
    }
}

#[async_trait]
impl Assembler for ImageAssembler {
    async fn assemble(&self, bundle: &Bundle, dest: &Path) -> Result<()> {
        info!("creating image file...");
        let spec = ImageSpec {
            rootfs: &bundle.rootfs_path,
            descriptors: &bundle.json_objects,
            packager: &self.packager,
            extra_args: &self.extra_args,
            encryption: bundle.opts.encryption_key_info.as_ref(),
        };
        self.writer.write_image(&spec, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::parse_mount_info;

    const TABLE: &str = "\
22 1 8:1 / / rw,relatime - ext4 /dev/sda1 rw
40 22 8:2 / /opt/secure rw,nosuid,noexec - tmpfs tmpfs rw
";

    #[test]
    fn test_noexec_destination_refused() {
        let entries = parse_mount_info(TABLE).unwrap();
        let err = ensure_exec_dest(Path::new("/opt/secure/sandbox"), &entries).unwrap_err();
        assert!(matches!(err, VesselError::MountInoperable { .. }));
        ensure_exec_dest(Path::new("/home/user/sandbox"), &entries).unwrap();
    }

    #[tokio::test]
    async fn test_sandbox_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bundle = Bundle::new(&tmp.path().join("parent"), tmp.path()).unwrap();
        std::fs::write(bundle.rootfs_path.join("marker"), b"x").unwrap();
        bundle.recipe = crate::recipe::Definition::default();

        let dest = tmp.path().join("sandbox");
        SandboxAssembler { copy: false }.assemble(&bundle, &dest).await.unwrap();
        assert!(dest.join("marker").is_file());
        assert!(!bundle.rootfs_path.exists());
    }

    #[tokio::test]
    async fn test_sandbox_copy_replaces_existing_dest() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = Bundle::new(&tmp.path().join("parent"), tmp.path()).unwrap();
        std::fs::write(bundle.rootfs_path.join("new"), b"x").unwrap();

        let dest = tmp.path().join("sandbox");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("stale"), b"y").unwrap();

        SandboxAssembler { copy: true }.assemble(&bundle, &dest).await.unwrap();
        assert!(dest.join("new").is_file());
        assert!(!dest.join("stale").exists());
        // Copy mode leaves the bundle rootfs in place.
        assert!(bundle.rootfs_path.exists());
    }

    struct RecordingWriter {
        seen: std::sync::Arc<std::sync::Mutex<Option<(usize, bool)>>>,
    }

    #[async_trait]
    impl ImageWriter for RecordingWriter {
        async fn write_image(&self, spec: &ImageSpec<'_>, _dest: &Path) -> Result<()> {
            *self.seen.lock().unwrap() =
                Some((spec.descriptors.len(), spec.encryption.is_some()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_image_assembler_forwards_descriptors_and_key() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bundle = Bundle::new(&tmp.path().join("parent"), tmp.path()).unwrap();
        bundle
            .json_objects
            .insert("inspect-metadata-json".to_string(), b"{}".to_vec());
        bundle.opts.encryption_key_info =
            Some(EncryptionKeyInfo { material: b"secret".to_vec() });

        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let assembler = ImageAssembler::new(
            SquashfsPackager {
                path: PathBuf::from("/usr/bin/mksquashfs"),
                procs: 2,
                mem: None,
            },
            Box::new(RecordingWriter { seen: seen.clone() }),
            vec!["-comp".to_string(), "zstd".to_string()],
        );

        assembler.assemble(&bundle, &tmp.path().join("out.img")).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((1, true)));
    }
}
