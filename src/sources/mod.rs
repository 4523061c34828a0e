//! Bootstrap source dispatch.
//!
//! Every recipe names a bootstrap agent (`docker`, `yum`, `scratch`, ...).
//! A [`ConveyorPacker`] fetches the source bits for one agent and unpacks
//! them into a bundle's rootfs. The [`SourceRegistry`] maps agent names to
//! factories; transports for network-backed agents are registered by the
//! caller, the purely local agents ship built in.

pub mod local;
pub mod scratch;

use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::error::{Result, VesselError};
use crate::recipe::Definition;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// The bootstrap agents the engine recognizes.
pub const BOOTSTRAP_KINDS: &[&str] = &[
    "library",
    "docker",
    "docker-archive",
    "docker-daemon",
    "oci",
    "oci-archive",
    "scratch",
    "localimage",
    "yum",
    "debootstrap",
    "arch",
    "busybox",
    "zypper",
    "shub",
    "oras",
    "http",
    "https",
];

/// Error marker that makes a conveyor failure retryable.
pub const RETRY_MARKER: &str = "no descriptor found for reference";

/// Attempts before a retryable conveyor failure turns fatal.
pub const MAX_GET_ATTEMPTS: u32 = 5;

/// What a packer hands back for the assembler to record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// The bootstrap agent that produced the rootfs.
    pub kind: String,
    /// Source reference (image URI, path), when the agent has one.
    pub reference: Option<String>,
}

/// Fetches and unpacks one bootstrap source into a bundle.
#[async_trait]
pub trait ConveyorPacker: Send {
    /// Fetch source bits into the bundle. May perform network I/O and must
    /// honor cancellation.
    async fn get(&mut self, ctx: &CancelToken, bundle: &mut Bundle) -> Result<()>;

    /// Unpack the fetched bits into `bundle.rootfs_path`.
    async fn pack(&mut self, ctx: &CancelToken, bundle: &mut Bundle) -> Result<SourceDescriptor>;
}

/// Factory producing a conveyor-packer for a parsed definition.
pub type SourceFactory =
    Box<dyn Fn(&Definition) -> Result<Box<dyn ConveyorPacker>> + Send + Sync>;

/// Owned table mapping bootstrap agents to conveyor-packer factories.
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// A registry with the local agents (`scratch`, `localimage`) installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "scratch",
            Box::new(|_| {
                let cp: Box<dyn ConveyorPacker> = Box::new(scratch::ScratchConveyorPacker);
                Ok(cp)
            }),
        );
        registry.register(
            "localimage",
            Box::new(|def| {
                let from = def.header.get("from").cloned().unwrap_or_default();
                let cp: Box<dyn ConveyorPacker> = Box::new(local::LocalConveyorPacker::new(from));
                Ok(cp)
            }),
        );
        registry
    }

    /// Install a factory for a bootstrap agent, replacing any existing one.
    pub fn register(&mut self, kind: &str, factory: SourceFactory) {
        debug!("registering conveyor-packer for bootstrap agent {kind}");
        self.factories.insert(kind.to_string(), factory);
    }

    /// Resolve the conveyor-packer for a definition's bootstrap agent.
    pub fn conveyor_packer(&self, def: &Definition) -> Result<Box<dyn ConveyorPacker>> {
        let kind = def
            .bootstrap()
            .map(str::to_lowercase)
            .ok_or_else(|| VesselError::InvalidHeader {
                reason: "no bootstrap agent specified in header".to_string(),
            })?;
        if !BOOTSTRAP_KINDS.contains(&kind.as_str()) {
            return Err(VesselError::UnknownBootstrap { kind });
        }
        let factory = self.factories.get(&kind).ok_or_else(|| {
            VesselError::UnsupportedOperation {
                operation: format!("bootstrap from '{kind}'"),
                reason: "no conveyor-packer registered for this agent".to_string(),
            }
        })?;
        factory(def)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Run `get` with the bounded retry the conveyor contract allows: an error
/// carrying [`RETRY_MARKER`] is retried up to [`MAX_GET_ATTEMPTS`] times,
/// anything else is immediately fatal.
pub async fn get_with_retry(
    cp: &mut dyn ConveyorPacker,
    ctx: &CancelToken,
    bundle: &mut Bundle,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let err = match cp.get(ctx, bundle).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        attempt += 1;
        if !err.to_string().contains(RETRY_MARKER) || attempt == MAX_GET_ATTEMPTS {
            return Err(VesselError::ConveyorFailed { reason: err.to_string() });
        }
        info!("conveyor failed to get reference descriptor, trying again");
        debug!("error from conveyor get: {err}");
    }
}

/// Materialize the reserved `/.singularity.d` subtree inside a fresh rootfs.
///
/// Existing files are left alone so update builds keep their metadata.
pub fn make_base_env(rootfs: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for dir in [".singularity.d", ".singularity.d/env", ".singularity.d/libs"] {
        let path = rootfs.join(dir);
        std::fs::create_dir_all(&path).map_err(|e| VesselError::io(&path, e))?;
    }
    let base = rootfs.join(".singularity.d/env/01-base.sh");
    if !base.exists() {
        std::fs::write(&base, b"#!/bin/sh\n").map_err(|e| VesselError::io(&base, e))?;
        std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| VesselError::io(&base, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyConveyor {
        attempts: u32,
        succeed_after: u32,
        retryable: bool,
    }

    #[async_trait]
    impl ConveyorPacker for FlakyConveyor {
        async fn get(&mut self, _ctx: &CancelToken, _bundle: &mut Bundle) -> Result<()> {
            self.attempts += 1;
            if self.attempts > self.succeed_after {
                return Ok(());
            }
            if self.retryable {
                Err(VesselError::ConveyorFailed {
                    reason: format!("{RETRY_MARKER}: attempt {}", self.attempts),
                })
            } else {
                Err(VesselError::ConveyorFailed { reason: "hard failure".to_string() })
            }
        }

        async fn pack(
            &mut self,
            _ctx: &CancelToken,
            _bundle: &mut Bundle,
        ) -> Result<SourceDescriptor> {
            Ok(SourceDescriptor::default())
        }
    }

    fn test_bundle() -> (tempfile::TempDir, Bundle) {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = Bundle::new(&tmp.path().join("parent"), tmp.path()).unwrap();
        (tmp, bundle)
    }

    #[tokio::test]
    async fn test_retry_on_marker() {
        let (_tmp, mut bundle) = test_bundle();
        let mut conveyor = FlakyConveyor { attempts: 0, succeed_after: 3, retryable: true };
        get_with_retry(&mut conveyor, &CancelToken::new(), &mut bundle)
            .await
            .unwrap();
        assert_eq!(conveyor.attempts, 4);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_five_attempts() {
        let (_tmp, mut bundle) = test_bundle();
        let mut conveyor = FlakyConveyor { attempts: 0, succeed_after: 99, retryable: true };
        let err = get_with_retry(&mut conveyor, &CancelToken::new(), &mut bundle)
            .await
            .unwrap_err();
        assert_eq!(conveyor.attempts, MAX_GET_ATTEMPTS);
        assert!(err.to_string().contains(RETRY_MARKER));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_immediately_fatal() {
        let (_tmp, mut bundle) = test_bundle();
        let mut conveyor = FlakyConveyor { attempts: 0, succeed_after: 99, retryable: false };
        get_with_retry(&mut conveyor, &CancelToken::new(), &mut bundle)
            .await
            .unwrap_err();
        assert_eq!(conveyor.attempts, 1);
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = SourceRegistry::with_defaults();

        let def = Definition::from_uri("docker://alpine").unwrap();
        // Known agent without a registered transport.
        assert!(matches!(
            registry.conveyor_packer(&def),
            Err(VesselError::UnsupportedOperation { .. })
        ));

        let mut def = Definition::default();
        def.header.insert("bootstrap".to_string(), "teleport".to_string());
        assert!(matches!(
            registry.conveyor_packer(&def),
            Err(VesselError::UnknownBootstrap { .. })
        ));

        let mut def = Definition::default();
        def.header.insert("bootstrap".to_string(), "scratch".to_string());
        assert!(registry.conveyor_packer(&def).is_ok());
    }

    #[test]
    fn test_make_base_env() {
        let tmp = tempfile::tempdir().unwrap();
        make_base_env(tmp.path()).unwrap();
        assert!(tmp.path().join(".singularity.d/env/01-base.sh").is_file());
        assert!(tmp.path().join(".singularity.d/libs").is_dir());
        // Re-running over an existing tree is a no-op.
        make_base_env(tmp.path()).unwrap();
    }
}
