//! SCIF-style app sections.
//!
//! Recipes may carry `app*` sections keyed by an app name. This plugin
//! aggregates them per app, writes each app's runtime scaffolding under
//! `/scif/apps/<name>` inside the bundle rootfs, and synthesizes the shell
//! fragment that installs the apps during `%post`.

use crate::bundle::Bundle;
use crate::error::{Result, VesselError};
use crate::fsutil;
use crate::metadata::handle_shebang;
use crate::recipe::{parser, Script};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const APPS_ROOT: &str = "scif/apps";

/// All sections collected for one app.
#[derive(Debug, Clone, Default)]
struct App {
    install: String,
    labels: String,
    files: String,
    env: String,
    test: String,
    help: String,
    run: String,
    start: String,
}

/// Aggregates `app*` sections and emits per-app scaffolding.
#[derive(Debug, Default)]
pub struct Apps {
    apps: HashMap<String, App>,
}

impl Apps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one custom section, keyed `"<prefix> <appname>"`, into the
    /// aggregate. Keys without an app prefix are ignored.
    pub fn handle_section(&mut self, key: &str, body: &str) {
        let (prefix, name) = match key.split_once(' ') {
            Some(split) => split,
            None => return,
        };
        let app = self.apps.entry(name.to_string()).or_default();
        let slot = match prefix {
            "appinstall" => &mut app.install,
            "applabels" => &mut app.labels,
            "appfiles" => &mut app.files,
            "appenv" => &mut app.env,
            "apptest" => &mut app.test,
            "apphelp" => &mut app.help,
            "apprun" => &mut app.run,
            "appstart" => &mut app.start,
            other => {
                warn!("ignoring unknown app section prefix {other}");
                return;
            }
        };
        slot.push_str(body);
    }

    /// Write each app's filesystem scaffolding into the bundle rootfs, in
    /// the order the apps first appeared in the recipe.
    pub fn handle_bundle(&self, bundle: &Bundle, order: &[String]) -> Result<()> {
        for name in order {
            let app = match self.apps.get(name) {
                Some(app) => app,
                None => continue,
            };
            info!("creating SCIF app {name}");
            self.write_app(bundle, name, app)?;
        }
        Ok(())
    }

    fn write_app(&self, bundle: &Bundle, name: &str, app: &App) -> Result<()> {
        let base = bundle.rootfs_path.join(APPS_ROOT).join(name);
        for dir in ["scif", "scif/env", "bin", "lib"] {
            let path = base.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| VesselError::io(&path, e))?;
        }

        if !app.labels.is_empty() {
            let labels: BTreeMap<String, String> =
                parser::parse_labels(&app.labels).into_iter().collect();
            let text = serde_json::to_string_pretty(&labels)
                .map_err(|e| VesselError::Internal(format!("encoding app labels: {e}")))?;
            write_file(&base.join("scif/labels.json"), text.as_bytes(), 0o644)?;
        }

        if !app.env.is_empty() {
            write_file(
                &base.join("scif/env/90-environment.sh"),
                app.env.as_bytes(),
                0o755,
            )?;
        }

        if !app.help.is_empty() {
            write_file(&base.join("scif/runscript.help"), app.help.as_bytes(), 0o644)?;
        }

        for (body, file) in [
            (&app.run, "scif/runscript"),
            (&app.start, "scif/startscript"),
            (&app.test, "scif/test"),
        ] {
            if body.is_empty() {
                continue;
            }
            let script = Script { args: String::new(), script: (*body).clone() };
            let (shebang, script_body) = handle_shebang(&script);
            write_file(
                &base.join(file),
                format!("{shebang}\n\n{script_body}\n").as_bytes(),
                0o755,
            )?;
        }

        // %appfiles lines are host-side transfers into the app subtree.
        for line in app.files.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let src = match words.next() {
                Some(src) => PathBuf::from(src),
                None => continue,
            };
            let dst = match words.next() {
                Some(dst) => base.join(dst.trim_start_matches('/')),
                None => base.join(src.file_name().unwrap_or(src.as_os_str())),
            };
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|e| VesselError::io(parent, e))?;
            }
            debug!("copying app file {:?} to {:?}", src, dst);
            fsutil::copy_recursive(&src, &dst)?;
        }

        Ok(())
    }

    /// The shell fragment installing every app, in recipe order. The stage
    /// runner prepends it to the stage's `%post` script.
    pub fn post_fragment(&self, order: &[String]) -> String {
        let mut fragment = String::new();
        for name in order {
            let app = match self.apps.get(name) {
                Some(app) => app,
                None => continue,
            };
            if app.install.is_empty() {
                continue;
            }
            fragment.push_str(&format!(
                "\n# install app {name}\n\
                 export SCIF_APPNAME={name}\n\
                 export SCIF_APPROOT=/{APPS_ROOT}/{name}\n\
                 mkdir -p \"$SCIF_APPROOT\"\n\
                 cd \"$SCIF_APPROOT\"\n"
            ));
            fragment.push_str(&app.install);
            if !app.install.ends_with('\n') {
                fragment.push('\n');
            }
        }
        fragment
    }
}

fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    std::fs::write(path, content).map_err(|e| VesselError::io(path, e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| VesselError::io(path, e))
}
