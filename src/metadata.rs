//! Metadata injection into a stage's rootfs.
//!
//! Runs after the post script and before the test script. Writes the
//! reserved `/.singularity.d` files: help text, merged labels, the embedded
//! recipe (rotating any previous one into bootstrap history), environment,
//! start/run/test scripts, and finally the inspect summary descriptor that
//! the image assembler embeds into single-file output.

use crate::bundle::{Bundle, DESC_INSPECT_METADATA_JSON};
use crate::error::{Result, VesselError};
use crate::recipe::{parser, Script};
use chrono::{Datelike, Local, Timelike};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

const SINGULARITY_DIR: &str = ".singularity.d";
const HELP_PATH: &str = ".singularity.d/runscript.help";
const LABELS_PATH: &str = ".singularity.d/labels.json";
const DEFINITION_PATH: &str = ".singularity.d/Singularity";
const HISTORY_DIR: &str = ".singularity.d/bootstrap_history";
const ENV_PATH: &str = ".singularity.d/env/90-environment.sh";
// Written by post scripts that export additional labels.
const BUILD_LABELS_PATH: &str = ".build.labels";

/// Produces the inspect summary blob for a rootfs. The companion inspect
/// operation lives outside the engine.
pub trait Inspect: Send + Sync {
    fn inspect(&self, rootfs: &Path) -> Result<Vec<u8>>;
}

/// Inspector that reports an empty summary; useful where the companion
/// binary is unavailable.
pub struct NoopInspect;

impl Inspect for NoopInspect {
    fn inspect(&self, _rootfs: &Path) -> Result<Vec<u8>> {
        Ok(b"{}".to_vec())
    }
}

/// Insert all build metadata into the bundle rootfs.
pub fn insert_metadata(bundle: &mut Bundle, inspector: &dyn Inspect) -> Result<()> {
    insert_help_script(bundle)?;
    insert_labels_json(bundle)?;
    insert_definition(bundle)?;
    insert_env_script(bundle)?;
    insert_startscript(bundle)?;
    insert_runscript(bundle)?;
    insert_test_script(bundle)?;
    // The inspect descriptor summarizes everything above, so it goes last.
    insert_inspect_metadata(bundle, inspector)?;
    Ok(())
}

fn insert_help_script(bundle: &Bundle) -> Result<()> {
    if !bundle.run_section("help") || bundle.recipe.image_scripts.help.script.is_empty() {
        return Ok(());
    }
    let path = bundle.rootfs_path.join(HELP_PATH);
    if path.exists() && !bundle.opts.force {
        warn!("help message already exists and force option is false, not overwriting");
        return Ok(());
    }
    info!("adding help info");
    let content = format!("{}\n", bundle.recipe.image_scripts.help.script);
    write_file(&path, content.as_bytes(), 0o644)
}

fn insert_labels_json(bundle: &Bundle) -> Result<()> {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();

    // (a) labels already present in the rootfs.
    let labels_path = bundle.rootfs_path.join(LABELS_PATH);
    if labels_path.exists() {
        let bytes = std::fs::read(&labels_path).map_err(|e| VesselError::io(&labels_path, e))?;
        labels = serde_json::from_slice(&bytes).map_err(|e| {
            VesselError::Internal(format!("malformed {LABELS_PATH}: {e}"))
        })?;
    }

    // (b) labels exported by post scripts through the build-labels file.
    let build_labels = bundle.rootfs_path.join(BUILD_LABELS_PATH);
    match std::fs::read_to_string(&build_labels) {
        Ok(content) => {
            std::fs::remove_file(&build_labels)
                .map_err(|e| VesselError::io(&build_labels, e))?;
            for (key, value) in parser::parse_labels(&content) {
                merge_label(&mut labels, key, value, bundle.opts.force);
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(VesselError::io(&build_labels, err)),
    }

    // (c) the recipe's own labels.
    if bundle.run_section("labels") && !bundle.recipe.labels.is_empty() {
        info!("adding labels");
        for (key, value) in &bundle.recipe.labels {
            merge_label(&mut labels, key.clone(), value.clone(), bundle.opts.force);
        }
    }

    add_build_labels(&mut labels, bundle);

    let text = serde_json::to_string_pretty(&labels)
        .map_err(|e| VesselError::Internal(format!("encoding labels: {e}")))?;
    write_file(&labels_path, text.as_bytes(), 0o644)
}

// Newer wins under force, otherwise the existing value is kept.
fn merge_label(labels: &mut BTreeMap<String, String>, key: String, value: String, force: bool) {
    if let Some(existing) = labels.get_mut(&key) {
        if force {
            *existing = value;
        } else {
            warn!("label: {key} already exists and force option is false, not overwriting");
        }
    } else {
        labels.insert(key, value);
    }
}

// Labels the build itself contributes; these always win.
fn add_build_labels(labels: &mut BTreeMap<String, String>, bundle: &Bundle) {
    labels.insert("org.label-schema.schema-version".to_string(), "1.0".to_string());

    let now = Local::now();
    let build_date = format!(
        "{}_{}_{}_{}_{}:{}:{}_{}",
        now.format("%A"),
        now.day(),
        now.format("%B"),
        now.year(),
        now.hour(),
        now.minute(),
        now.second(),
        now.format("%Z"),
    );
    labels.insert("org.label-schema.build-date".to_string(), build_date);

    labels.insert(
        "org.label-schema.usage.apptainer.version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );

    if bundle.run_section("help") && !bundle.recipe.image_scripts.help.script.is_empty() {
        labels.insert("org.label-schema.usage".to_string(), format!("/{HELP_PATH}"));
        labels.insert(
            "org.label-schema.usage.apptainer.runscript.help".to_string(),
            format!("/{HELP_PATH}"),
        );
    }

    // Header info, only if this build actually bootstrapped.
    if !bundle.opts.update || bundle.opts.force {
        for (key, value) in &bundle.recipe.header {
            labels.insert(
                format!("org.label-schema.usage.singularity.deffile.{key}"),
                value.clone(),
            );
        }
    }

    if !bundle.opts.tag.is_empty() && !bundle.opts.digest.is_empty() {
        labels.insert(
            "org.opencontainers.image.base.name".to_string(),
            bundle.opts.tag.clone(),
        );
        labels.insert(
            "org.opencontainers.image.base.digest".to_string(),
            bundle.opts.digest.clone(),
        );
    }

    labels.insert(
        "org.label-schema.build-arch".to_string(),
        normalize_arch(&bundle.opts.arch).to_string(),
    );
}

/// Normalize an architecture name to its OCI form for the build-arch label.
pub fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "arm" | "armv6l" | "armv7l" => "arm",
        "i386" | "i686" | "386" => "386",
        "ppc64le" => "ppc64le",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        other => other,
    }
}

fn insert_definition(bundle: &Bundle) -> Result<()> {
    let def_path = bundle.rootfs_path.join(DEFINITION_PATH);

    // Rotate any previous recipe into bootstrap history.
    if def_path.exists() {
        let history = bundle.rootfs_path.join(HISTORY_DIR);
        if !history.is_dir() {
            std::fs::create_dir(&history).map_err(|e| VesselError::io(&history, e))?;
        }
        let count = std::fs::read_dir(&history)
            .map_err(|e| VesselError::io(&history, e))?
            .count();
        let rotated = history.join(format!("Apptainer{count}"));
        debug!("moving previous definition to {:?}", rotated);
        std::fs::rename(&def_path, &rotated).map_err(|e| VesselError::io(&rotated, e))?;
    }

    write_file(&def_path, &bundle.recipe.full_raw, 0o644)
}

fn insert_env_script(bundle: &Bundle) -> Result<()> {
    if !bundle.run_section("environment")
        || bundle.recipe.image_scripts.environment.script.is_empty()
    {
        return Ok(());
    }
    info!("adding environment to container");
    let script = &bundle.recipe.image_scripts.environment.script;
    let path = bundle.rootfs_path.join(ENV_PATH);
    if path.exists() {
        let mut content =
            std::fs::read_to_string(&path).map_err(|e| VesselError::io(&path, e))?;
        content.push_str(&format!("\n{script}\n"));
        std::fs::write(&path, content).map_err(|e| VesselError::io(&path, e))
    } else {
        write_file(&path, format!("#!/bin/sh\n\n{script}\n").as_bytes(), 0o755)
    }
}

/// Split a script into shebang and body.
///
/// A body whose first line starts with `#!` supplies its own interpreter,
/// otherwise `/bin/sh` is assumed. Section args, stripped of `#` comments,
/// are appended to the shebang.
pub(crate) fn handle_shebang(script: &Script) -> (String, String) {
    let mut shebang = "#!/bin/sh".to_string();
    let mut body = script.script.clone();

    let trimmed = script.script.trim_start();
    if trimmed.starts_with("#!") {
        match trimmed.split_once('\n') {
            Some((first, rest)) => {
                shebang = first.trim().to_string();
                body = rest.to_string();
            }
            None => {
                shebang = trimmed.trim_end().to_string();
                body = String::new();
            }
        }
    }

    if !script.args.is_empty() {
        let args = script.args.split('#').next().unwrap_or_default();
        shebang = format!("{shebang} {args}");
    }
    (shebang, body)
}

fn insert_script(bundle: &Bundle, section: &str, script: &Script, file: &str) -> Result<()> {
    if !bundle.run_section(section) || script.script.is_empty() {
        return Ok(());
    }
    info!("adding {section}");
    let (shebang, body) = handle_shebang(script);
    let path = bundle.rootfs_path.join(SINGULARITY_DIR).join(file);
    write_file(&path, format!("{shebang}\n\n{body}\n").as_bytes(), 0o755)
}

fn insert_runscript(bundle: &Bundle) -> Result<()> {
    insert_script(bundle, "runscript", &bundle.recipe.image_scripts.runscript, "runscript")
}

fn insert_startscript(bundle: &Bundle) -> Result<()> {
    insert_script(bundle, "startscript", &bundle.recipe.image_scripts.startscript, "startscript")
}

fn insert_test_script(bundle: &Bundle) -> Result<()> {
    insert_script(bundle, "test", &bundle.recipe.image_scripts.test, "test")
}

fn insert_inspect_metadata(bundle: &mut Bundle, inspector: &dyn Inspect) -> Result<()> {
    let raw = inspector.inspect(&bundle.rootfs_path)?;
    // Round-trip through a JSON value so a malformed summary fails here
    // rather than inside the image writer.
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| VesselError::Internal(format!("decoding inspect metadata: {e}")))?;
    let data = serde_json::to_vec(&value)
        .map_err(|e| VesselError::Internal(format!("encoding inspect metadata: {e}")))?;
    bundle.json_objects.insert(DESC_INSPECT_METADATA_JSON.to_string(), data);
    Ok(())
}

fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    std::fs::write(path, content).map_err(|e| VesselError::io(path, e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| VesselError::io(path, e))
}
