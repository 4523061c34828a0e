//! Per-stage build execution.
//!
//! A [`Stage`] pairs one parsed definition with its bundle, its bootstrap
//! source and, for the final stage, an assembler. The orchestrator drives
//! every stage through the same sequence: pre, pack, files-from-stage,
//! setup, files-from-host, post, metadata, test. Pre and setup run on the
//! host; post and test run inside the bundle through the external
//! [`ScriptEngine`].

use crate::assembler::Assembler;
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::error::{Result, VesselError};
use crate::fsutil;
use crate::recipe::Script;
use crate::sources::ConveyorPacker;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Which container-side script is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerScript {
    Post,
    Test,
}

impl ContainerScript {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Test => "test",
        }
    }
}

/// Executes post/test scripts inside the bundle's rootfs. The concrete
/// engine is the platform's container runtime, outside this crate.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    async fn run_in_container(
        &self,
        ctx: &CancelToken,
        bundle: &Bundle,
        kind: ContainerScript,
        script: &Script,
        resolv: Option<&Path>,
        hosts: Option<&Path>,
    ) -> Result<()>;
}

/// One build stage: definition, bundle, source and (final stage only) the
/// assembler.
pub struct Stage {
    pub name: String,
    pub bundle: Bundle,
    pub(crate) source: Option<Box<dyn ConveyorPacker>>,
    pub(crate) assembler: Option<Box<dyn Assembler>>,
}

impl Stage {
    /// Run a `%pre` or `%setup` script on the host with the build's
    /// environment. A failure aborts the entire build.
    pub(crate) async fn run_host_script(
        &self,
        ctx: &CancelToken,
        name: &str,
        script: &Script,
    ) -> Result<()> {
        if script.script.is_empty() || !self.bundle.run_section(name) {
            return Ok(());
        }
        info!("running {name} scriptlet");

        let mut child = Command::new("/bin/sh")
            .args(["-e", "-c", script.script.as_str()])
            .spawn()
            .map_err(|e| VesselError::ScriptFailure {
                name: name.to_string(),
                reason: format!("failed to spawn shell: {e}"),
            })?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| VesselError::ScriptFailure {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
                if !status.success() {
                    return Err(VesselError::ScriptFailure {
                        name: name.to_string(),
                        reason: format!("{status}"),
                    });
                }
                Ok(())
            }
            _ = ctx.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(VesselError::Interrupted)
            }
        }
    }

    /// Copy declared files from earlier-stage bundles into this stage's
    /// rootfs. Blocks without a `from=` marker are host transfers and are
    /// skipped here.
    pub(crate) fn copy_files_from_stages(&mut self, earlier: &[Stage]) -> Result<()> {
        let blocks = self.bundle.recipe.files.clone();
        for block in &blocks {
            let stage_name = match block.stage() {
                Some(name) => name,
                None => continue,
            };
            let source_stage = earlier
                .iter()
                .find(|s| s.name == stage_name)
                .ok_or_else(|| VesselError::StageLookup { stage: stage_name.to_string() })?;

            info!("copying files from stage {stage_name}");
            for transfer in &block.files {
                let src = join_inside(&source_stage.bundle.rootfs_path, &transfer.src);
                let dst_rel = if transfer.dst.is_empty() { &transfer.src } else { &transfer.dst };
                let dst = join_inside(&self.bundle.rootfs_path, dst_rel);
                copy_into(&src, &dst)?;
            }
        }
        Ok(())
    }

    /// Copy declared files from the host into this stage's rootfs.
    pub(crate) fn copy_files_from_host(&self) -> Result<()> {
        for block in &self.bundle.recipe.files {
            if block.stage().is_some() {
                continue;
            }
            if !block.files.is_empty() {
                info!("copying files from host");
            }
            for transfer in &block.files {
                let src = PathBuf::from(&transfer.src);
                let dst_rel = if transfer.dst.is_empty() { &transfer.src } else { &transfer.dst };
                let dst = join_inside(&self.bundle.rootfs_path, dst_rel);
                copy_into(&src, &dst)?;
            }
        }
        Ok(())
    }

    /// Materialize a session copy of a host file (`/etc/resolv.conf`,
    /// `/etc/hosts`) in the bundle's scratch space. A missing host file is
    /// only a warning; the build proceeds without the session copy.
    pub(crate) fn create_session_file(
        &self,
        host_path: &str,
        warning: &str,
    ) -> Result<Option<PathBuf>> {
        let src = Path::new(host_path);
        if !src.exists() {
            warn!("{warning}: {host_path} does not exist on host");
            return Ok(None);
        }
        let name = src
            .file_name()
            .ok_or_else(|| VesselError::Internal(format!("no file name in {host_path}")))?;
        let dest = self.bundle.tmp_dir.join(name);
        std::fs::copy(src, &dest).map_err(|e| VesselError::io(&dest, e))?;
        debug!("session file for {host_path} at {:?}", dest);
        Ok(Some(dest))
    }
}

/// Whether the user supplied a bind mount for `destination`.
pub fn have_bind_for(binds: &[String], destination: &str) -> bool {
    binds.iter().any(|bind| {
        let mut parts = bind.split(':');
        let src = parts.next().unwrap_or_default();
        let dst = parts.next().unwrap_or(src);
        dst == destination
    })
}

// Join a recipe-supplied path under a rootfs, treating it as rooted there.
fn join_inside(rootfs: &Path, path: &str) -> PathBuf {
    rootfs.join(path.trim_start_matches('/'))
}

fn copy_into(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(VesselError::io(
            src,
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
        ));
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VesselError::io(parent, e))?;
    }
    fsutil::copy_recursive(src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::parser::parse_definition;

    fn stage_named(tmp: &Path, name: &str, recipe: &[u8]) -> Stage {
        let mut bundle =
            Bundle::new(&tmp.join(format!("parent-{name}")), tmp).unwrap();
        bundle.recipe = parse_definition(recipe).unwrap();
        Stage { name: name.to_string(), bundle, source: None, assembler: None }
    }

    #[test]
    fn test_have_bind_for() {
        let binds = vec![
            "/etc/resolv.conf".to_string(),
            "/data/src:/etc/hosts".to_string(),
            "/cache:/var/cache:ro".to_string(),
        ];
        assert!(have_bind_for(&binds, "/etc/resolv.conf"));
        assert!(have_bind_for(&binds, "/etc/hosts"));
        assert!(have_bind_for(&binds, "/var/cache"));
        assert!(!have_bind_for(&binds, "/data/src"));
    }

    #[test]
    fn test_copy_files_from_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let builder = stage_named(tmp.path(), "builder", b"Bootstrap: scratch\nStage: builder\n");
        std::fs::create_dir_all(builder.bundle.rootfs_path.join("out")).unwrap();
        std::fs::write(builder.bundle.rootfs_path.join("out/app"), b"bin").unwrap();

        let mut last = stage_named(
            tmp.path(),
            "final",
            b"Bootstrap: scratch\nStage: final\n%files from=builder\n/out/app /usr/bin/app\n",
        );
        let earlier = vec![builder];
        last.copy_files_from_stages(&earlier).unwrap();
        assert_eq!(
            std::fs::read(last.bundle.rootfs_path.join("usr/bin/app")).unwrap(),
            b"bin"
        );
    }

    #[test]
    fn test_copy_from_unknown_stage_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut last = stage_named(
            tmp.path(),
            "final",
            b"Bootstrap: scratch\nStage: final\n%files from=ghost\n/x /x\n",
        );
        let err = last.copy_files_from_stages(&[]).unwrap_err();
        assert!(matches!(err, VesselError::StageLookup { .. }));
    }

    #[test]
    fn test_copy_files_from_host_empty_dst() {
        let tmp = tempfile::tempdir().unwrap();
        let host_file = tmp.path().join("payload.txt");
        std::fs::write(&host_file, b"data").unwrap();

        let recipe = format!("Bootstrap: scratch\n%files\n{}\n", host_file.display());
        let stage = stage_named(tmp.path(), "only", recipe.as_bytes());
        stage.copy_files_from_host().unwrap();

        // Empty dst means the same path inside the rootfs.
        let inside = join_inside(&stage.bundle.rootfs_path, &host_file.display().to_string());
        assert_eq!(std::fs::read(inside).unwrap(), b"data");
    }

    #[test]
    fn test_copy_missing_host_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let stage = stage_named(
            tmp.path(),
            "only",
            b"Bootstrap: scratch\n%files\n/definitely/not/here /x\n",
        );
        assert!(stage.copy_files_from_host().is_err());
    }

    #[tokio::test]
    async fn test_host_script_success_and_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let stage = stage_named(tmp.path(), "only", b"Bootstrap: scratch\n");
        let ctx = CancelToken::new();

        let ok = Script { args: String::new(), script: "true".to_string() };
        stage.run_host_script(&ctx, "pre", &ok).await.unwrap();

        let fail = Script { args: String::new(), script: "exit 7".to_string() };
        let err = stage.run_host_script(&ctx, "pre", &fail).await.unwrap_err();
        assert!(matches!(err, VesselError::ScriptFailure { .. }));
    }

    #[tokio::test]
    async fn test_host_script_skipped_when_gated_off() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stage = stage_named(tmp.path(), "only", b"Bootstrap: scratch\n");
        stage.bundle.opts.sections = vec!["none".to_string()];
        let script = Script { args: String::new(), script: "exit 1".to_string() };
        // Gated off, so the failing script never runs.
        stage
            .run_host_script(&CancelToken::new(), "pre", &script)
            .await
            .unwrap();
    }

    #[test]
    fn test_session_file_created_and_missing_host_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let stage = stage_named(tmp.path(), "only", b"Bootstrap: scratch\n");

        let session = stage
            .create_session_file("/etc/hostname", "host name could be wrong")
            .unwrap();
        if Path::new("/etc/hostname").exists() {
            assert!(session.unwrap().is_file());
        }

        let missing = stage
            .create_session_file("/definitely/not/here", "ignored")
            .unwrap();
        assert!(missing.is_none());
    }
}
