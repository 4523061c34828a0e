//! Build-argument expansion.
//!
//! Before a stage is parsed for real, `{{ name }}` placeholders in its raw
//! bytes are substituted from caller-supplied values overlaid on the
//! defaults declared in the stage's `%arguments` section. Placeholders with
//! neither a caller value nor a default pass through unchanged; unconsumed
//! caller arguments are reported back, not fatal.

use super::Definition;
use regex::bytes::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::warn;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder regex"))
}

/// Read the default `name=value` pairs from a stage's `%arguments` section.
pub fn read_defaults(def: &Definition) -> HashMap<String, String> {
    let mut defaults = HashMap::new();
    for line in def.build_scripts.arguments.script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((name, value)) => {
                defaults.insert(name.trim().to_string(), value.trim().to_string());
            }
            None => warn!("ignoring malformed build argument default: {line}"),
        }
    }
    defaults
}

/// Substitute `{{ name }}` placeholders in `raw`.
///
/// Caller values win over defaults. Every placeholder resolved from the
/// caller map records its name in `consumed` so the orchestrator can report
/// unused caller arguments afterwards.
pub fn expand(
    raw: &[u8],
    caller: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
    consumed: &mut HashSet<String>,
) -> Vec<u8> {
    placeholder()
        .replace_all(raw, |caps: &regex::bytes::Captures| {
            let name = String::from_utf8_lossy(&caps[1]).into_owned();
            if let Some(value) = caller.get(&name) {
                consumed.insert(name);
                value.as_bytes().to_vec()
            } else if let Some(value) = defaults.get(&name) {
                consumed.insert(name);
                value.as_bytes().to_vec()
            } else {
                // Tolerant policy: leave the placeholder for later layers.
                caps[0].to_vec()
            }
        })
        .into_owned()
}
