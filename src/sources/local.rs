//! The `localimage` bootstrap agent: build on top of an existing sandbox.
//!
//! Update builds reuse this packer to extract the destination container back
//! into the bundle before the recipe runs again on top of it.

use super::{make_base_env, ConveyorPacker, SourceDescriptor};
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::error::{Result, VesselError};
use crate::fsutil;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Conveyor-packer sourcing from a local image or sandbox path.
pub struct LocalConveyorPacker {
    src: PathBuf,
}

impl LocalConveyorPacker {
    pub fn new(src: impl Into<PathBuf>) -> Self {
        Self { src: src.into() }
    }

    /// The packer used when updating an existing destination container.
    pub fn for_update(dest: &Path) -> Self {
        info!("building into existing container: {}", dest.display());
        Self { src: dest.to_path_buf() }
    }
}

#[async_trait]
impl ConveyorPacker for LocalConveyorPacker {
    async fn get(&mut self, ctx: &CancelToken, _bundle: &mut Bundle) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(VesselError::Interrupted);
        }
        if !self.src.exists() {
            return Err(VesselError::ConveyorFailed {
                reason: format!("local source {} does not exist", self.src.display()),
            });
        }
        Ok(())
    }

    async fn pack(&mut self, ctx: &CancelToken, bundle: &mut Bundle) -> Result<SourceDescriptor> {
        if ctx.is_cancelled() {
            return Err(VesselError::Interrupted);
        }
        if !self.src.is_dir() {
            // Single-file images need the external extraction tooling; the
            // engine only unpacks sandbox directories itself.
            return Err(VesselError::UnsupportedOperation {
                operation: format!("unpack local image {}", self.src.display()),
                reason: "only sandbox directories can be unpacked locally".to_string(),
            });
        }

        debug!("unpacking sandbox {} into bundle", self.src.display());
        for entry in
            std::fs::read_dir(&self.src).map_err(|e| VesselError::io(&self.src, e))?
        {
            let entry = entry.map_err(|e| VesselError::io(&self.src, e))?;
            fsutil::copy_recursive(
                &entry.path(),
                &bundle.rootfs_path.join(entry.file_name()),
            )?;
        }
        make_base_env(&bundle.rootfs_path)?;

        Ok(SourceDescriptor {
            kind: "localimage".to_string(),
            reference: Some(self.src.display().to_string()),
        })
    }
}
