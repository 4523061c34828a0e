//! The `scratch` bootstrap agent: an empty rootfs.

use super::{make_base_env, ConveyorPacker, SourceDescriptor};
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::error::{Result, VesselError};
use async_trait::async_trait;
use tracing::debug;

/// Conveyor-packer that produces a bare rootfs with only the reserved
/// metadata subtree.
pub struct ScratchConveyorPacker;

#[async_trait]
impl ConveyorPacker for ScratchConveyorPacker {
    async fn get(&mut self, ctx: &CancelToken, _bundle: &mut Bundle) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(VesselError::Interrupted);
        }
        debug!("scratch bootstrap: nothing to fetch");
        Ok(())
    }

    async fn pack(&mut self, ctx: &CancelToken, bundle: &mut Bundle) -> Result<SourceDescriptor> {
        if ctx.is_cancelled() {
            return Err(VesselError::Interrupted);
        }
        make_base_env(&bundle.rootfs_path)?;
        Ok(SourceDescriptor { kind: "scratch".to_string(), reference: None })
    }
}
