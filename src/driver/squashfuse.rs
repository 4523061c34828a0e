//! Supervised `squashfuse` mount helper.

use super::{
    spawn_and_await_mount, stop_child, with_ambient_sys_admin, DriverFeature, ImageDriver,
    MountParams,
};
use crate::error::Result;
use crate::fsutil;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "squashfuse";
const BIN_NAME: &str = "squashfuse";

/// Mounts squashfs images through the `squashfuse` helper.
pub struct SquashFuseDriver {
    bin: PathBuf,
    child: Option<Child>,
}

impl SquashFuseDriver {
    /// Locate the helper binary. Returns `None`, without error, when it is
    /// absent; the engine may still work via in-kernel mounts.
    pub fn init(desired: DriverFeature) -> Option<Self> {
        match fsutil::find_on_path(BIN_NAME) {
            Some(bin) => Some(Self { bin, child: None }),
            None => {
                debug!("{DRIVER_NAME} driver not enabled: {BIN_NAME} not found");
                if desired.contains(DriverFeature::IMAGE_MOUNT) {
                    info!("{BIN_NAME} not found, will not be able to mount image files");
                }
                None
            }
        }
    }
}

// Argument vector for one mount, plus the raw descriptor to attach as the
// child's fd 3 when the source is an inherited `/proc/self/fd` path.
fn mount_argv(params: &MountParams) -> (Vec<String>, Option<i32>) {
    let opts = format!("offset={}", params.offset);
    let (source, fd) = match inherited_fd(&params.source) {
        Some(fd) => ("/proc/self/fd/3".to_string(), Some(fd)),
        None => (params.source.display().to_string(), None),
    };
    let argv = vec![
        "-f".to_string(),
        "-o".to_string(),
        opts,
        source,
        params.target.display().to_string(),
    ];
    (argv, fd)
}

fn inherited_fd(source: &Path) -> Option<i32> {
    if source.parent() != Some(Path::new("/proc/self/fd")) {
        return None;
    }
    source.file_name()?.to_str()?.parse().ok()
}

#[async_trait]
impl ImageDriver for SquashFuseDriver {
    fn features(&self) -> DriverFeature {
        DriverFeature::IMAGE_MOUNT
    }

    async fn mount(&mut self, params: &MountParams) -> Result<()> {
        let (argv, fd) = mount_argv(params);
        debug!("executing {:?} {:?}", self.bin, argv);

        let mut cmd = Command::new(&self.bin);
        cmd.args(&argv);
        if let Some(fd) = fd {
            // Attach the inherited descriptor as the child's fd 3 so the
            // helper can mount without re-opening the image by path.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::dup2(fd, 3) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
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
