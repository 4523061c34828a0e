//! Composite driver over the squashfuse and fuse-overlayfs helpers.
//!
//! Installed only when the caller is unprivileged and no explicit image
//! driver is configured. Mount requests dispatch on the requested
//! filesystem; start and stop fan out to both members.

use super::{overlayfs::OverlayFuseDriver, squashfuse::SquashFuseDriver};
use super::{DriverFeature, ImageDriver, MountParams};
use crate::error::{Result, VesselError};
use async_trait::async_trait;

pub const DRIVER_NAME: &str = "fuseapps";

/// Composition of the two FUSE helpers.
pub struct FuseAppsDriver {
    squash: Option<SquashFuseDriver>,
    overlay: Option<OverlayFuseDriver>,
}

impl FuseAppsDriver {
    pub fn new(squash: Option<SquashFuseDriver>, overlay: Option<OverlayFuseDriver>) -> Self {
        Self { squash, overlay }
    }
}

#[async_trait]
impl ImageDriver for FuseAppsDriver {
    fn features(&self) -> DriverFeature {
        let mut features = DriverFeature::empty();
        if let Some(squash) = &self.squash {
            features |= squash.features();
        }
        if let Some(overlay) = &self.overlay {
            features |= overlay.features();
        }
        features
    }

    async fn mount(&mut self, params: &MountParams) -> Result<()> {
        if params.filesystem == "overlay" {
            if let Some(overlay) = &mut self.overlay {
                return overlay.mount(params).await;
            }
        } else if let Some(squash) = &mut self.squash {
            return squash.mount(params).await;
        }
        Err(VesselError::MountInoperable {
            reason: format!("no image driver registered for type {}", params.filesystem),
        })
    }

    async fn start(&mut self) -> Result<()> {
        if let Some(squash) = &mut self.squash {
            squash.start().await?;
        }
        if let Some(overlay) = &mut self.overlay {
            overlay.start().await?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(squash) = &mut self.squash {
            squash.stop().await?;
        }
        if let Some(overlay) = &mut self.overlay {
            overlay.stop().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_composition_has_no_features() {
        let mut driver = FuseAppsDriver::new(None, None);
        assert_eq!(driver.features(), DriverFeature::empty());

        let params = MountParams { filesystem: "overlay".to_string(), ..Default::default() };
        let err = driver.mount(&params).await.unwrap_err();
        assert!(err.to_string().contains("no image driver registered"));

        // Stopping with no members is a no-op.
        driver.stop().await.unwrap();
    }
}
