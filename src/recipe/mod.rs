//! Recipe data model for the Vessel build engine.
//!
//! A *recipe* is a declarative file with a colon-delimited header and a
//! sequence of `%`-prefixed sections. Parsing one stage of a recipe yields a
//! [`Definition`]; multi-stage files yield one `Definition` per stage. The
//! known sections live in dedicated fields, SCIF-style `app*` sections and
//! anything else the parser tolerated live in `custom`.

pub mod args;
pub mod parser;

#[cfg(test)]
mod parser_tests;

use crate::error::{Result, VesselError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// URI schemes accepted as a build spec in place of a recipe file.
pub const VALID_URI_SCHEMES: &[&str] = &[
    "library",
    "shub",
    "docker",
    "docker-archive",
    "docker-daemon",
    "oci",
    "oci-archive",
    "oras",
    "http",
    "https",
];

/// One section body plus the arguments that followed the section name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub args: String,
    pub script: String,
}

impl Script {
    /// Whether neither a body nor args were parsed for this section.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.script.is_empty()
    }
}

/// Scripts embedded into the image and consumed at container runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageScripts {
    pub help: Script,
    pub environment: Script,
    pub runscript: Script,
    pub test: Script,
    pub startscript: Script,
}

/// Scripts consumed during the build itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildScripts {
    pub arguments: Script,
    pub pre: Script,
    pub setup: Script,
    pub post: Script,
    pub test: Script,
}

/// A single `src [dst]` file transfer. An empty `dst` means "same path".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub src: String,
    pub dst: String,
}

/// One `%files [args]` block. Blocks with identical args are merged by the
/// parser, preserving order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Files {
    pub args: String,
    pub files: Vec<FileTransfer>,
}

impl Files {
    /// The stage name this block copies from, if its args carry `from=`.
    pub fn stage(&self) -> Option<&str> {
        self.args
            .split_whitespace()
            .find_map(|tok| tok.strip_prefix("from="))
            .filter(|s| !s.is_empty())
    }
}

/// One parsed recipe stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Lowercased header keywords to values (`bootstrap`, `from`, ...).
    pub header: HashMap<String, String>,
    pub image_scripts: ImageScripts,
    pub build_scripts: BuildScripts,
    /// Ordered `%files` blocks.
    pub files: Vec<Files>,
    /// Ordered label pairs from `%labels`.
    pub labels: Vec<(String, String)>,
    /// Raw bodies of `app*` sections, keyed `"<prefix> <appname>"`.
    pub custom: HashMap<String, String>,
    /// App names in order of first appearance.
    pub app_order: Vec<String>,
    /// Recipe bytes of this stage, after build-argument substitution.
    #[serde(skip)]
    pub raw: Vec<u8>,
    /// Concatenated `raw` across all stages of the recipe.
    #[serde(skip)]
    pub full_raw: Vec<u8>,
}

impl Definition {
    /// Build a definition directly from a `scheme://rest` spec.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| VesselError::RecipeParse {
            reason: format!("build spec is not a URI: {uri}"),
        })?;
        let mut header = HashMap::new();
        header.insert("bootstrap".to_string(), scheme.to_string());
        header.insert("from".to_string(), rest.to_string());
        Ok(Self {
            header,
            raw: uri.as_bytes().to_vec(),
            full_raw: uri.as_bytes().to_vec(),
            ..Self::default()
        })
    }

    /// Whether `spec` looks like a URI the engine can bootstrap from.
    pub fn is_valid_uri(spec: &str) -> bool {
        match spec.split_once("://") {
            Some((scheme, _)) => VALID_URI_SCHEMES.contains(&scheme.to_lowercase().as_str()),
            None => false,
        }
    }

    /// The bootstrap agent named by the header, if any.
    pub fn bootstrap(&self) -> Option<&str> {
        self.header.get("bootstrap").map(String::as_str)
    }

    /// The stage name from the header, if any.
    pub fn stage_name(&self) -> &str {
        self.header.get("stage").map(String::as_str).unwrap_or("")
    }

    /// Look up a label by key.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether no useful information was parsed into this definition.
    ///
    /// Raw bytes are deliberately ignored: a stage consisting only of blank
    /// lines and comments still carries raw bytes but no data.
    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
            && self.image_scripts == ImageScripts::default()
            && self.build_scripts == BuildScripts::default()
            && self.files.is_empty()
            && self.labels.is_empty()
            && self.custom.is_empty()
            && self.app_order.is_empty()
    }

    /// Field-wise equality ignoring the raw byte fields.
    pub fn same_content(&self, other: &Self) -> bool {
        self.header == other.header
            && self.image_scripts == other.image_scripts
            && self.build_scripts == other.build_scripts
            && self.files == other.files
            && self.labels == other.labels
            && self.custom == other.custom
            && self.app_order == other.app_order
    }

    /// Re-render this definition in the recipe grammar.
    ///
    /// Sections come out in a fixed order with labels and files preserving
    /// insertion order; re-parsing the result yields a definition with the
    /// same content.
    pub fn render(&self) -> String {
        let mut out = String::new();

        // bootstrap and from lead, the rest of the header follows sorted.
        fn rank(key: &str) -> u8 {
            match key {
                "bootstrap" => 0,
                "from" => 1,
                _ => 2,
            }
        }
        let mut keys: Vec<&String> = self.header.keys().collect();
        keys.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
        for key in keys {
            out.push_str(&format!("{}: {}\n", key, self.header[key]));
        }

        // No blank separator lines: the tokenizer folds trailing blank
        // lines into the preceding section body, which would break the
        // parse -> render -> parse round trip.
        let mut section = |name: &str, s: &Script| {
            if s.is_empty() {
                return;
            }
            if s.args.is_empty() {
                out.push_str(&format!("%{name}\n"));
            } else {
                out.push_str(&format!("%{} {}\n", name, s.args));
            }
            out.push_str(&s.script);
            if !s.script.ends_with('\n') {
                out.push('\n');
            }
        };

        section("help", &self.image_scripts.help);
        section("arguments", &self.build_scripts.arguments);
        section("pre", &self.build_scripts.pre);
        section("setup", &self.build_scripts.setup);
        section("post", &self.build_scripts.post);
        section("environment", &self.image_scripts.environment);
        section("runscript", &self.image_scripts.runscript);
        section("startscript", &self.image_scripts.startscript);
        // %test populates both script sets from one body; emit it once.
        section("test", &self.image_scripts.test);

        if !self.labels.is_empty() {
            out.push_str("%labels\n");
            for (key, value) in &self.labels {
                out.push_str(&format!("{key} {value}\n"));
            }
        }

        for block in &self.files {
            if block.args.is_empty() {
                out.push_str("%files\n");
            } else {
                out.push_str(&format!("%files {}\n", block.args));
            }
            for transfer in &block.files {
                let src = quote_if_needed(&transfer.src);
                if transfer.dst.is_empty() {
                    out.push_str(&format!("{src}\n"));
                } else {
                    out.push_str(&format!("{} {}\n", src, quote_if_needed(&transfer.dst)));
                }
            }
        }

        let mut custom_keys: Vec<&String> = self.custom.keys().collect();
        custom_keys.sort();
        for key in custom_keys {
            out.push_str(&format!("%{key}\n"));
            let body = &self.custom[key];
            out.push_str(body);
            if !body.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

fn quote_if_needed(s: &str) -> String {
    if s.chars().any(char::is_whitespace) {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}
