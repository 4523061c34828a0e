//! Build orchestration.
//!
//! A [`Build`] owns the ordered stages of one container build and drives
//! each through its state machine: pre, pack, files-from-stage, setup,
//! files-from-host, post, metadata, test. The final stage is handed to its
//! assembler. Cleanup runs on normal completion, on failure and on
//! interrupt; SIGINT/SIGTERM cancel the build through the token threaded
//! into every blocking call.

use crate::apps::Apps;
use crate::assembler::{
    Assembler, ImageAssembler, ImageWriter, SandboxAssembler, SquashfsPackager,
    UnsupportedImageWriter,
};
use crate::bundle::{Bundle, Options};
use crate::cancel::CancelToken;
use crate::driver::{DriverFeature, DriverRegistry};
use crate::error::{Result, VesselError};
use crate::fsutil::{self, UmaskGuard};
use crate::metadata::{insert_metadata, Inspect, NoopInspect};
use crate::proc;
use crate::recipe::{args, parser, Definition};
use crate::sources::{self, local::LocalConveyorPacker, ConveyorPacker, SourceRegistry};
use crate::stage::{have_bind_for, ContainerScript, ScriptEngine, Stage};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Output format of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Directory tree at the destination.
    Sandbox,
    /// Single-file image with embedded rootfs and metadata descriptors.
    Image,
}

/// Cross-stage build configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the container after the build completes.
    pub dest: PathBuf,
    pub format: Format,
    /// Options shared with every bundle.
    pub opts: Options,
}

/// The external collaborators a build executes against.
pub struct Runtime {
    /// Runs post/test scripts inside the bundle.
    pub engine: Box<dyn ScriptEngine>,
    /// Produces the inspect summary descriptor.
    pub inspector: Box<dyn Inspect>,
    /// Bootstrap agent dispatch table.
    pub sources: SourceRegistry,
    /// Writes single-file image output.
    pub image_writer: Box<dyn ImageWriter>,
}

impl Runtime {
    /// A runtime with default sources, a no-op inspector and no image
    /// writer; enough for sandbox builds from local bootstrap agents.
    pub fn new(engine: Box<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            inspector: Box::new(NoopInspect),
            sources: SourceRegistry::with_defaults(),
            image_writer: Box::new(UnsupportedImageWriter),
        }
    }
}

/// One container build, from parsed definitions to the assembled artifact.
pub struct Build {
    stages: Vec<Stage>,
    conf: Config,
    runtime: Runtime,
    cancel: CancelToken,
    /// Image mount drivers; the build owns their whole lifecycle.
    drivers: DriverRegistry,
    signals_installed: bool,
}

impl Build {
    /// Create a build from a spec: a URI, an existing image or sandbox
    /// path, or a definition file. Returns the build together with the
    /// caller-supplied build arguments that were never consumed.
    pub fn from_spec(
        spec: &str,
        build_args: &HashMap<String, String>,
        conf: Config,
        runtime: Runtime,
    ) -> Result<(Self, Vec<String>)> {
        let (defs, unused) = make_all_defs(spec, build_args)?;
        for name in &unused {
            warn!("build argument {name} was never consumed");
        }
        Ok((Self::new(defs, conf, runtime)?, unused))
    }

    /// Create a build from already-parsed definitions.
    pub fn new(defs: Vec<Definition>, mut conf: Config, mut runtime: Runtime) -> Result<Self> {
        if defs.is_empty() {
            return Err(VesselError::NoStages);
        }

        let _umask = UmaskGuard::set(0o002);

        conf.dest = fsutil::absolute(&conf.dest)?;
        // Updating always targets a sandbox.
        if conf.opts.update {
            conf.format = Format::Sandbox;
        }

        let entries = proc::get_mount_info(proc::SELF_MOUNTINFO)?;
        let last = defs.len() - 1;
        let multi_stage = defs.len() > 1;
        let mut stages = Vec::with_capacity(defs.len());
        let mut sandbox_copy = false;

        for (i, def) in defs.into_iter().enumerate() {
            if multi_stage && !def.header.contains_key("stage") {
                return Err(VesselError::InvalidHeader {
                    reason: "multiple stages detected, all must have headers".to_string(),
                });
            }

            let rootfs_parent = match conf.format {
                Format::Sandbox => conf
                    .dest
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/")),
                Format::Image => conf.opts.tmp_dir.clone(),
            };
            let parent_path = crate::bundle::unique_dir(&rootfs_parent, "build-temp-")?;

            let mut bundle = Bundle::new(&parent_path, &conf.opts.tmp_dir)?;
            bundle.opts = conf.opts.clone();
            bundle.recipe = def;

            if conf.format == Format::Sandbox && i == last {
                if bundle.rootfs_relocated() {
                    // The filesystem under the destination rejects chown;
                    // assemble by copying so the sandbox still comes out.
                    sandbox_copy = true;
                    warn!(
                        "the filesystem hosting {:?} won't allow to set ownership, \
                         the sandbox could not preserve image ownerships",
                        conf.dest
                    );
                } else {
                    let entry = proc::find_parent_entry(&rootfs_parent, &entries)?;
                    if entry.options.iter().any(|o| o == "noexec") {
                        return Err(VesselError::MountInoperable {
                            reason: format!(
                                "'noexec' mount option set on {}, sandbox {} won't be usable \
                                 at this location",
                                entry.point.display(),
                                conf.dest.display()
                            ),
                        });
                    }
                }
            }
            if i == last {
                let entry = proc::find_parent_entry(&conf.opts.tmp_dir, &entries)?;
                for opt in &entry.options {
                    match opt.as_str() {
                        "nodev" => warn!(
                            "'nodev' mount option set on {}, it could be a source of failure \
                             during build process",
                            entry.point.display()
                        ),
                        "noexec" => {
                            return Err(VesselError::MountInoperable {
                                reason: format!(
                                    "'noexec' mount option set on {}, temporary root filesystem \
                                     won't be usable at this location",
                                    entry.point.display()
                                ),
                            })
                        }
                        _ => {}
                    }
                }
            }

            // No source needed when the bootstrap is skipped entirely.
            let source: Option<Box<dyn ConveyorPacker>> =
                if conf.opts.update && !conf.opts.force {
                    None
                } else {
                    Some(runtime.sources.conveyor_packer(&bundle.recipe)?)
                };

            stages.push(Stage {
                name: bundle.recipe.stage_name().to_string(),
                bundle,
                source,
                assembler: None,
            });
        }

        // Only the final stage gets an assembler. The image writer moves
        // into the assembler; image-file builds hand it over here.
        let assembler: Box<dyn Assembler> = match conf.format {
            Format::Sandbox => Box::new(SandboxAssembler { copy: sandbox_copy }),
            Format::Image => {
                let writer = std::mem::replace(
                    &mut runtime.image_writer,
                    Box::new(UnsupportedImageWriter),
                );
                Box::new(ImageAssembler::new(
                    SquashfsPackager::locate()?,
                    writer,
                    conf.opts.mksquashfs_args.clone(),
                ))
            }
        };
        // Unprivileged builds get the FUSE mount helpers, unless an
        // explicit image driver is configured elsewhere.
        let mut drivers = DriverRegistry::new();
        if conf.opts.unprivilege {
            drivers.install_fuse_drivers(
                None,
                true,
                DriverFeature::IMAGE_MOUNT | DriverFeature::OVERLAY_MOUNT,
            )?;
        }

        let mut build = Self {
            stages,
            conf,
            runtime,
            cancel: CancelToken::new(),
            drivers,
            signals_installed: false,
        };
        build.stages[last].assembler = Some(assembler);
        Ok(build)
    }

    /// The image mount drivers installed for this build.
    pub fn drivers(&mut self) -> &mut DriverRegistry {
        &mut self.drivers
    }

    /// The cancellation token driving this build.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the whole build from start to finish.
    #[instrument(skip(self), fields(dest = %self.conf.dest.display()))]
    pub async fn full(&mut self) -> Result<()> {
        info!("starting build...");
        self.install_signal_handler();

        let _umask = UmaskGuard::set(0o002);
        let result = self.run_stages().await;
        self.clean_up().await;
        self.drivers.stop_all().await;

        match result {
            Err(_) if self.cancel.is_cancelled() => Err(VesselError::Interrupted),
            other => other,
        }
    }

    async fn run_stages(&mut self) -> Result<()> {
        let last = self.stages.len() - 1;
        for i in 0..self.stages.len() {
            self.run_stage(i, i == last).await?;
        }

        debug!("calling assembler");
        let stage = &self.stages[last];
        let assembler = stage
            .assembler
            .as_ref()
            .ok_or_else(|| VesselError::Internal("final stage has no assembler".to_string()))?;
        assembler.assemble(&stage.bundle, &self.conf.dest).await?;

        info!("build complete: {}", self.conf.dest.display());
        Ok(())
    }

    async fn run_stage(&mut self, i: usize, is_last: bool) -> Result<()> {
        let ctx = self.cancel.clone();

        // Pre runs on the host before anything is fetched.
        {
            let stage = &self.stages[i];
            let pre = stage.bundle.recipe.build_scripts.pre.clone();
            stage.run_host_script(&ctx, "pre", &pre).await?;
        }

        self.pack_stage(i, is_last).await?;
        self.scaffold_apps(i)?;

        // Cross-stage transfers read completed earlier stages only.
        if self.stages[i].bundle.run_section("files") {
            let (earlier, rest) = self.stages.split_at_mut(i);
            rest[0].copy_files_from_stages(earlier)?;
        }

        {
            let stage = &self.stages[i];
            let setup = stage.bundle.recipe.build_scripts.setup.clone();
            stage.run_host_script(&ctx, "setup", &setup).await?;
        }

        if self.stages[i].bundle.run_section("files") {
            self.stages[i].copy_files_from_host()?;
        }

        self.run_container_phase(i).await
    }

    async fn pack_stage(&mut self, i: usize, is_last: bool) -> Result<()> {
        let ctx = self.cancel.clone();
        let stage = &mut self.stages[i];
        let update = stage.bundle.opts.update && !stage.bundle.opts.force && is_last;

        if update {
            // Extract the existing destination back into the bundle.
            let mut packer = LocalConveyorPacker::for_update(&self.conf.dest);
            packer.get(&ctx, &mut stage.bundle).await?;
            packer.pack(&ctx, &mut stage.bundle).await?;
            return Ok(());
        }

        if stage.bundle.opts.image_cache.is_none() {
            return Err(VesselError::UndefinedImageCache);
        }
        let Stage { bundle, source, .. } = stage;
        let source = source
            .as_mut()
            .ok_or_else(|| VesselError::Internal("stage has no conveyor-packer".to_string()))?;
        sources::get_with_retry(source.as_mut(), &ctx, bundle).await?;
        let descriptor = source
            .pack(&ctx, bundle)
            .await
            .map_err(|e| VesselError::PackerFailed { reason: e.to_string() })?;
        debug!("packed rootfs from {} source", descriptor.kind);
        Ok(())
    }

    // Aggregate app sections, write the SCIF scaffolding and prepend the
    // synthesized install fragment to %post.
    fn scaffold_apps(&mut self, i: usize) -> Result<()> {
        let bundle = &mut self.stages[i].bundle;
        if bundle.recipe.custom.is_empty() {
            return Ok(());
        }
        let mut apps = Apps::new();
        for (key, body) in &bundle.recipe.custom {
            apps.handle_section(key, body);
        }
        let order = bundle.recipe.app_order.clone();
        apps.handle_bundle(bundle, &order)?;

        let fragment = apps.post_fragment(&order);
        if !fragment.is_empty() {
            let post = &mut bundle.recipe.build_scripts.post;
            post.script = format!("{fragment}{}", post.script);
        }
        Ok(())
    }

    // Post, metadata and test, with session resolv/hosts files that only
    // live for the duration of the stage.
    async fn run_container_phase(&mut self, i: usize) -> Result<()> {
        let ctx = self.cancel.clone();
        let stage = &mut self.stages[i];
        let binds = stage.bundle.opts.binds.clone();

        let mut session_files: Vec<PathBuf> = Vec::new();
        let mut session_resolv = None;
        let mut session_hosts = None;
        if !have_bind_for(&binds, "/etc/resolv.conf") {
            session_resolv =
                stage.create_session_file("/etc/resolv.conf", "name resolution could fail")?;
        }
        if !have_bind_for(&binds, "/etc/hosts") {
            session_hosts =
                stage.create_session_file("/etc/hosts", "host resolution could fail")?;
        }
        session_files.extend(session_resolv.iter().cloned());
        session_files.extend(session_hosts.iter().cloned());

        let engine = self.runtime.engine.as_ref();
        let inspector = self.runtime.inspector.as_ref();
        let result = async {
            let post = stage.bundle.recipe.build_scripts.post.clone();
            if stage.bundle.run_section("post") && !post.script.is_empty() {
                info!("running post scriptlet");
                engine
                    .run_in_container(
                        &ctx,
                        &stage.bundle,
                        ContainerScript::Post,
                        &post,
                        session_resolv.as_deref(),
                        session_hosts.as_deref(),
                    )
                    .await?;
            }

            debug!("inserting metadata");
            insert_metadata(&mut stage.bundle, inspector)?;

            let test = stage.bundle.recipe.build_scripts.test.clone();
            if stage.bundle.run_section("test") && !test.script.is_empty() {
                info!("running test scriptlet");
                engine
                    .run_in_container(
                        &ctx,
                        &stage.bundle,
                        ContainerScript::Test,
                        &test,
                        session_resolv.as_deref(),
                        session_hosts.as_deref(),
                    )
                    .await?;
            }
            Ok(())
        }
        .await;

        for file in session_files {
            let _ = std::fs::remove_file(file);
        }
        result
    }

    // SIGINT/SIGTERM cancel the build; installation happens once.
    fn install_signal_handler(&mut self) {
        if self.signals_installed {
            return;
        }
        self.signals_installed = true;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                    }
                    Err(err) => {
                        warn!("failed to install SIGTERM handler: {err}");
                        std::future::pending::<()>().await;
                    }
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = terminate => info!("received SIGTERM"),
            }
            cancel.cancel();
        });
    }

    /// Remove build remnants unless the user asked to keep them.
    async fn clean_up(&self) {
        if self.conf.opts.no_clean_up {
            let paths: Vec<&Path> = self
                .stages
                .iter()
                .flat_map(|s| [s.bundle.rootfs_path.as_path(), s.bundle.tmp_dir.as_path()])
                .collect();
            info!("build performed with no clean up option, bundle(s) located at: {paths:?}");
            return;
        }
        for stage in &self.stages {
            debug!(
                "cleaning up {:?} and {:?}",
                stage.bundle.rootfs_path, stage.bundle.tmp_dir
            );
            if let Err(err) = stage.bundle.remove() {
                warn!("could not remove bundle: {err}");
            }
        }
    }
}

/// Resolve a build spec into its definitions.
///
/// The ladder: URI → existing image/sandbox (folded to `localimage://`) →
/// definition file with build-argument expansion. Returns the definitions
/// and the caller-supplied arguments that were never consumed.
pub fn make_all_defs(
    spec: &str,
    build_args: &HashMap<String, String>,
) -> Result<(Vec<Definition>, Vec<String>)> {
    if Definition::is_valid_uri(spec) {
        return Ok((vec![Definition::from_uri(spec)?], Vec::new()));
    }

    let path = Path::new(spec);
    if looks_like_image(path) {
        let def = Definition::from_uri(&format!("localimage://{spec}"))?;
        return Ok((vec![def], Vec::new()));
    }

    let raw = std::fs::read(path).map_err(|e| VesselError::io(path, e))?;
    let pre = parser::parse_all_bytes(&raw)?;

    let mut consumed = HashSet::new();
    let mut revised = Vec::with_capacity(pre.len());
    for def in &pre {
        let defaults = args::read_defaults(def);
        let expanded = args::expand(&def.raw, build_args, &defaults, &mut consumed);
        revised.push(parser::parse_definition(&expanded)?);
    }

    let full_raw: Vec<u8> = revised.iter().flat_map(|d| d.raw.clone()).collect();
    for def in &mut revised {
        def.full_raw = full_raw.clone();
    }

    let mut unused: Vec<String> = build_args
        .keys()
        .filter(|name| !consumed.contains(*name))
        .cloned()
        .collect();
    unused.sort();
    Ok((revised, unused))
}

// Whether the path already holds a built container: a sandbox directory, a
// squashfs image, or a single-file image with its launch preamble.
fn looks_like_image(path: &Path) -> bool {
    if path.is_dir() {
        return true;
    }
    let mut head = [0u8; 64];
    let n = match std::fs::File::open(path) {
        Ok(mut f) => {
            use std::io::Read;
            f.read(&mut head).unwrap_or(0)
        }
        Err(_) => return false,
    };
    let head = &head[..n];
    head.starts_with(b"hsqs") || head.starts_with(b"#!/usr/bin/env run-singularity")
}
