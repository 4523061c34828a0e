//! Supervised `fuse-overlayfs` mount helper.

use super::{
    spawn_and_await_mount, stop_child, with_ambient_sys_admin, DriverFeature, ImageDriver,
    MountParams,
};
use crate::error::Result;
use crate::fsutil;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "overlayfsfuse";
const BIN_NAME: &str = "fuse-overlayfs";

/// Mounts overlay filesystems through the `fuse-overlayfs` helper.
pub struct OverlayFuseDriver {
    bin: PathBuf,
    child: Option<Child>,
}

impl OverlayFuseDriver {
    /// Locate the helper binary. Returns `None`, without error, when it is
    /// absent; overlay may still work on a new enough kernel.
    pub fn init(desired: DriverFeature) -> Option<Self> {
        match fsutil::find_on_path(BIN_NAME) {
            Some(bin) => Some(Self { bin, child: None }),
            None => {
                debug!("{DRIVER_NAME} driver not enabled: {BIN_NAME} not found");
                if desired.contains(DriverFeature::OVERLAY_MOUNT) {
                    info!("{BIN_NAME} not found");
                }
                None
            }
        }
    }
}

fn mount_argv(params: &MountParams) -> Vec<String> {
    vec![
        "-f".to_string(),
        "-o".to_string(),
        params.fs_options.join(","),
        params.target.display().to_string(),
    ]
}

#[async_trait]
impl ImageDriver for OverlayFuseDriver {
    fn features(&self) -> DriverFeature {
        DriverFeature::OVERLAY_MOUNT
    }

    async fn mount(&mut self, params: &MountParams) -> Result<()> {
        let argv = mount_argv(params);
        debug!("executing {:?} {:?}", self.bin, argv);

        let mut cmd = Command::new(&self.bin);
        cmd.args(&argv);
        with_ambient_sys_admin(&mut cmd);

        let child = spawn_and_await_mount(cmd, BIN_NAME, &params.target).await?;
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        stop_child(&mut self.child, BIN_NAME).await;
        Ok(())
    }
}
