//! End-to-end build of a scratch recipe into a sandbox.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use vessel_build::bundle::ImageCache;
use vessel_build::{
    Build, Bundle, CancelToken, Config, ContainerScript, Format, Options, Result, Runtime, Script,
    ScriptEngine,
};

/// Engine stub that records which container scripts it was asked to run.
struct RecordingEngine {
    calls: Arc<Mutex<Vec<(ContainerScript, String)>>>,
}

#[async_trait::async_trait]
impl ScriptEngine for RecordingEngine {
    async fn run_in_container(
        &self,
        _ctx: &CancelToken,
        _bundle: &Bundle,
        kind: ContainerScript,
        script: &Script,
        _resolv: Option<&Path>,
        _hosts: Option<&Path>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((kind, script.script.clone()));
        Ok(())
    }
}

const RECIPE: &[u8] = b"Bootstrap: scratch\n\
%help\nA scratch demo container\n\
%environment\nexport DEMO=1\n\
%labels\nMaintainer hpc-team\n\
%runscript\necho hello\n\
%post\necho building\n\
%appinstall tool\necho installing tool\n\
%apprun tool\nexec tool \"$@\"\n\
";

#[tokio::test]
async fn test_full_scratch_sandbox_build() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_path = tmp.path().join("demo.def");
    std::fs::write(&recipe_path, RECIPE).unwrap();

    let dest = tmp.path().join("demo-sandbox");
    let conf = Config {
        dest: dest.clone(),
        format: Format::Sandbox,
        opts: Options {
            tmp_dir: tmp.path().to_path_buf(),
            image_cache: Some(ImageCache::new(tmp.path())),
            ..Options::default()
        },
    };

    let calls = Arc::new(Mutex::new(Vec::new()));
    let runtime = Runtime::new(Box::new(RecordingEngine { calls: calls.clone() }));

    let (mut build, unused) = Build::from_spec(
        recipe_path.to_str().unwrap(),
        &HashMap::new(),
        conf,
        runtime,
    )
    .unwrap();
    assert!(unused.is_empty());

    build.full().await.unwrap();

    // The sandbox carries the reserved metadata subtree.
    assert!(dest.is_dir());
    assert_eq!(std::fs::read(dest.join(".singularity.d/Singularity")).unwrap(), RECIPE);
    assert!(dest.join(".singularity.d/labels.json").is_file());
    assert!(dest.join(".singularity.d/runscript.help").is_file());

    let runscript = std::fs::read_to_string(dest.join(".singularity.d/runscript")).unwrap();
    assert!(runscript.starts_with("#!/bin/sh\n\n"));
    assert!(runscript.contains("echo hello"));

    let env = std::fs::read_to_string(dest.join(".singularity.d/env/90-environment.sh")).unwrap();
    assert!(env.contains("export DEMO=1"));

    // SCIF app scaffolding landed in the sandbox.
    assert!(dest.join("scif/apps/tool/scif/runscript").is_file());

    // The post script ran in-container with the app install fragment
    // prepended to the recipe's own body.
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (kind, script) = &calls[0];
    assert_eq!(*kind, ContainerScript::Post);
    let install = script.find("echo installing tool").unwrap();
    let user_post = script.find("echo building").unwrap();
    assert!(install < user_post, "app install fragment must come first");

    // Labels merged recipe and auto values.
    let labels: serde_json::Value = serde_json::from_slice(
        &std::fs::read(dest.join(".singularity.d/labels.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(labels["Maintainer"], "hpc-team");
    assert_eq!(labels["org.label-schema.schema-version"], "1.0");
    assert_eq!(
        labels["org.label-schema.usage.singularity.deffile.bootstrap"],
        "scratch"
    );

    // Cleanup removed every build-temp directory next to the destination.
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("build-temp-"))
        .collect();
    assert!(leftovers.is_empty(), "build-temp dirs not cleaned: {leftovers:?}");
}

#[tokio::test]
async fn test_build_without_image_cache_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_path = tmp.path().join("demo.def");
    std::fs::write(&recipe_path, b"Bootstrap: scratch\n%post\ntrue\n").unwrap();

    let conf = Config {
        dest: tmp.path().join("out"),
        format: Format::Sandbox,
        opts: Options {
            tmp_dir: tmp.path().to_path_buf(),
            image_cache: None,
            ..Options::default()
        },
    };
    let calls = Arc::new(Mutex::new(Vec::new()));
    let runtime = Runtime::new(Box::new(RecordingEngine { calls }));

    let (mut build, _) =
        Build::from_spec(recipe_path.to_str().unwrap(), &HashMap::new(), conf, runtime).unwrap();
    let err = build.full().await.unwrap_err();
    assert!(err.to_string().contains("undefined image cache"));
}
