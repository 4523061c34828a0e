//! Pluggable image mount drivers.
//!
//! When the engine runs unprivileged it cannot use in-kernel mounts, so
//! squashfs images and overlays are mounted by supervised FUSE helper
//! processes instead. Each helper is spawned with ambient `CAP_SYS_ADMIN`,
//! watched until its mount point appears in `/proc/self/mountinfo`, and
//! killed on shutdown.

pub mod fuseapps;
pub mod overlayfs;
pub mod squashfuse;

use crate::error::{Result, VesselError};
use crate::proc;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long a helper gets to produce its mount point.
pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between liveness/mount checks while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

bitflags::bitflags! {
    /// Which mount requests a driver may service.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFeature: u32 {
        /// Mount squashfs image files.
        const IMAGE_MOUNT = 1 << 0;
        /// Mount overlay filesystems.
        const OVERLAY_MOUNT = 1 << 1;
    }
}

/// Parameters of one mount request.
#[derive(Debug, Clone, Default)]
pub struct MountParams {
    /// Image path, or `/proc/self/fd/<k>` for an inherited descriptor.
    pub source: PathBuf,
    /// Directory the filesystem must appear at.
    pub target: PathBuf,
    /// Filesystem type (`squashfs`, `overlay`, ...); drives dispatch.
    pub filesystem: String,
    /// Byte offset of the filesystem within the source image.
    pub offset: u64,
    /// Filesystem options handed to the helper.
    pub fs_options: Vec<String>,
}

/// A mount provider.
#[async_trait]
pub trait ImageDriver: Send {
    /// The mount requests this driver may service.
    fn features(&self) -> DriverFeature;

    /// Perform a mount, blocking until the mount point exists.
    async fn mount(&mut self, params: &MountParams) -> Result<()>;

    /// Driver-wide startup; most drivers have none.
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tear down any helper processes. Tolerates helpers that are gone.
    async fn stop(&mut self) -> Result<()>;
}

/// Owned driver table. Registration is an operation on this table, not a
/// process-global side effect; the orchestrator owns the lifecycle.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<(String, Box<dyn ImageDriver>)>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a named driver. A second registration under the same name is
    /// an error.
    pub fn register(&mut self, name: &str, driver: Box<dyn ImageDriver>) -> Result<()> {
        if self.drivers.iter().any(|(n, _)| n == name) {
            return Err(VesselError::Internal(format!(
                "image driver {name} is already registered"
            )));
        }
        debug!("registering image driver {name}");
        self.drivers.push((name.to_string(), driver));
        Ok(())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn ImageDriver> {
        self.drivers
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, d)| &mut **d as &mut dyn ImageDriver)
    }

    /// Discover the FUSE helpers and install the composite `fuseapps`
    /// driver when the caller is unprivileged and no explicit driver is
    /// configured. Returns whether the driver was installed.
    pub fn install_fuse_drivers(
        &mut self,
        configured: Option<&str>,
        unprivileged: bool,
        desired: DriverFeature,
    ) -> Result<bool> {
        if let Some(name) = configured {
            if name != fuseapps::DRIVER_NAME {
                debug!("skipping {} drivers, {name} already configured", fuseapps::DRIVER_NAME);
                return Ok(false);
            }
        }
        if !unprivileged {
            // In-kernel mounts are available; the helpers are not needed.
            return Ok(false);
        }

        let squash = squashfuse::SquashFuseDriver::init(desired);
        let overlay = overlayfs::OverlayFuseDriver::init(desired);
        if squash.is_none() && overlay.is_none() {
            return Ok(false);
        }
        self.register(
            fuseapps::DRIVER_NAME,
            Box::new(fuseapps::FuseAppsDriver::new(squash, overlay)),
        )?;
        Ok(true)
    }

    /// Stop every registered driver.
    pub async fn stop_all(&mut self) {
        for (name, driver) in &mut self.drivers {
            if let Err(err) = driver.stop().await {
                warn!("stopping image driver {name}: {err}");
            }
        }
    }
}

// Raise ambient CAP_SYS_ADMIN for the helper child. The capability must be
// inheritable before it can be made ambient.
pub(crate) fn with_ambient_sys_admin(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            use caps::{raise, CapSet, Capability};
            raise(None, CapSet::Inheritable, Capability::CAP_SYS_ADMIN)
                .map_err(caps_io_error)?;
            raise(None, CapSet::Ambient, Capability::CAP_SYS_ADMIN).map_err(caps_io_error)?;
            Ok(())
        });
    }
}

fn caps_io_error(err: caps::errors::CapsError) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

// Internal outcome of the supervision race.
enum WaitOutcome {
    Mounted,
    Died(std::process::ExitStatus),
}

/// Spawn the helper and wait for its mount point to appear.
///
/// The helper dying during the wait surfaces its stderr verbatim; the
/// deadline passing kills the helper and reports a mount timeout. On
/// success the still-running child is returned for later teardown.
pub(crate) async fn spawn_and_await_mount(
    mut cmd: Command,
    bin_name: &str,
    target: &std::path::Path,
) -> Result<Child> {
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| VesselError::MountInoperable {
        reason: format!("{bin_name} start failed: {e}"),
    })?;

    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let supervision = async {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| VesselError::MountInoperable {
                        reason: format!("{bin_name} wait failed: {e}"),
                    })?;
                    return Ok(WaitOutcome::Died(status));
                }
                _ = interval.tick() => {
                    if proc::is_mount_point(proc::SELF_MOUNTINFO, target)? {
                        return Ok(WaitOutcome::Mounted);
                    }
                }
            }
        }
    };

    match tokio::time::timeout(MOUNT_TIMEOUT, supervision).await {
        Ok(Ok(WaitOutcome::Mounted)) => {
            debug!("{} mounted at {:?}", bin_name, target);
            Ok(child)
        }
        Ok(Ok(WaitOutcome::Died(status))) => {
            let stderr = stderr_task.await.unwrap_or_default();
            Err(VesselError::MountInoperable {
                reason: format!("{bin_name} failed: {status}: {stderr}"),
            })
        }
        Ok(Err(err)) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(err)
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(VesselError::MountInoperable {
                reason: format!(
                    "{bin_name} failed to mount {} in {:?}",
                    target.display(),
                    MOUNT_TIMEOUT
                ),
            })
        }
    }
}

/// Kill a helper child if it is still around.
pub(crate) async fn stop_child(child: &mut Option<Child>, bin_name: &str) {
    if let Some(mut child) = child.take() {
        debug!("killing {bin_name}");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}
