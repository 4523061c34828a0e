//! Recipe parser.
//!
//! Turns recipe text into [`Definition`]s. The grammar is line-oriented: an
//! optional colon-delimited header followed by `%`-prefixed sections whose
//! bodies run until the next section or end of input. Multi-stage files are
//! split on line-anchored `bootstrap:` occurrences before stage parsing.

use super::{Definition, FileTransfer, Files, Script};
use crate::error::{Result, VesselError};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// The sections every definition owns a slot for.
pub const VALID_SECTIONS: &[&str] = &[
    "help",
    "setup",
    "files",
    "labels",
    "environment",
    "pre",
    "post",
    "runscript",
    "test",
    "startscript",
    "arguments",
];

/// SCIF-style app section prefixes; these carry an app name as a second token.
pub const APP_SECTIONS: &[&str] = &[
    "appinstall",
    "applabels",
    "appfiles",
    "appenv",
    "apptest",
    "apphelp",
    "apprun",
    "appstart",
];

/// The closed set of header keywords. `otherurl&n` stands for `otherurl`
/// followed by a decimal index.
const VALID_HEADERS: &[&str] = &[
    "bootstrap",
    "from",
    "includecmd",
    "mirrorurl",
    "updateurl",
    "osversion",
    "include",
    "library",
    "registry",
    "namespace",
    "stage",
    "product",
    "user",
    "regcode",
    "productpgp",
    "registerurl",
    "modules",
    "otherurl&n",
    "fingerprints",
    "confurl",
    "setopt",
    "target",
    "frontend",
    "filename",
    "buildargs",
];

// Splits a files line on whitespace outside quotes, keeping `{{ arg }}`
// placeholders glued to their surrounding token.
fn file_splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([^\s"']*\{\{\s*\w+\s*\}\}*[^\s{}"']*)+|([^\s"']+|"([^"]*)"|'([^']*))"#)
            .expect("file splitter regex")
    })
}

fn stage_splitter() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| BytesRegex::new(r"(?mi)^bootstrap:").expect("stage splitter regex"))
}

/// Parse a single-stage definition from a reader.
pub fn parse_one(reader: &mut impl Read) -> Result<Definition> {
    let mut raw = Vec::new();
    reader
        .read_to_end(&mut raw)
        .map_err(|e| VesselError::io("<definition>", e))?;
    parse_definition(&raw)
}

/// Parse a single-stage definition from raw bytes.
pub fn parse_definition(raw: &[u8]) -> Result<Definition> {
    let mut def = Definition {
        raw: raw.to_vec(),
        full_raw: raw.to_vec(),
        ..Definition::default()
    };

    let text = String::from_utf8_lossy(raw);
    let tokens = tokenize(&text);

    let mut useful = tokens.iter().filter(|t| !t.trim().is_empty());
    let first = match useful.next() {
        Some(tok) => tok,
        None => return Err(VesselError::EmptyDefinition),
    };

    let mut sections: HashMap<String, Script> = HashMap::new();
    let mut files: Vec<Files> = Vec::new();
    let mut app_order: Vec<String> = Vec::new();

    // The first useful token is the header unless the file opens directly
    // with a section.
    let trimmed = first.trim();
    if !trimmed.starts_with('%') {
        parse_header(trimmed, &mut def)?;
    } else {
        parse_token_section(first, &mut sections, &mut files, &mut app_order)?;
    }

    for token in useful {
        parse_token_section(token, &mut sections, &mut files, &mut app_order)?;
    }

    populate_definition(sections, files, app_order, &mut def)?;
    Ok(def)
}

/// Parse a potentially multi-stage definition file into one definition per
/// stage.
///
/// Stages that parse to nothing are silently dropped; any other parse error
/// is fatal. Every returned definition carries the whole input as
/// `full_raw`.
pub fn parse_all(reader: &mut impl Read) -> Result<Vec<Definition>> {
    let mut raw = Vec::new();
    reader
        .read_to_end(&mut raw)
        .map_err(|e| VesselError::io("<definition>", e))?;
    parse_all_bytes(&raw)
}

/// [`parse_all`] over an in-memory buffer.
pub fn parse_all_bytes(raw: &[u8]) -> Result<Vec<Definition>> {
    let starts: Vec<usize> = stage_splitter().find_iter(raw).map(|m| m.start()).collect();

    let mut slices: Vec<&[u8]> = Vec::with_capacity(starts.len() + 1);
    let preamble_end = starts.first().copied().unwrap_or(raw.len());
    slices.push(&raw[..preamble_end]);
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(raw.len());
        slices.push(&raw[start..end]);
    }

    let mut stages = Vec::new();
    for slice in slices {
        if slice.is_empty() {
            continue;
        }
        match parse_definition(slice) {
            Ok(mut def) => {
                def.full_raw = raw.to_vec();
                stages.push(def);
            }
            Err(VesselError::EmptyDefinition) => continue,
            Err(err) => return Err(err),
        }
    }

    if stages.is_empty() {
        return Err(VesselError::NoStages);
    }
    Ok(stages)
}

/// Whether the file at `path` parses as a definition.
pub fn is_valid_definition(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    let raw = std::fs::read(path).map_err(|e| VesselError::io(path, e))?;
    Ok(parse_definition(&raw).is_ok())
}

/// Parse a `%labels` body into ordered key/value pairs. Later occurrences of
/// a key overwrite the value in place.
pub fn parse_labels(content: &str) -> Vec<(String, String)> {
    let mut labels: Vec<(String, String)> = Vec::new();
    for line in content.trim().lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, val) = match line.split_once(char::is_whitespace) {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (line.to_string(), String::new()),
        };
        match labels.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = val,
            None => labels.push((key, val)),
        }
    }
    labels
}

// Split the input into a header token plus one token per section. Section
// boundaries are lines whose first word starts with `%`.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut buf = String::new();
    let mut in_section = false;

    for line in text.lines() {
        let starts_section = line
            .split_whitespace()
            .next()
            .is_some_and(|w| w.starts_with('%'));
        if starts_section {
            if in_section || !buf.is_empty() {
                tokens.push(std::mem::take(&mut buf));
            }
            in_section = true;
        }
        buf.push_str(line);
        buf.push('\n');
    }
    if !buf.is_empty() {
        tokens.push(buf);
    }
    tokens
}

// The lowercased section name of a `%name [args]` line.
fn section_name(line: &str) -> String {
    line.trim_start_matches('%')
        .to_lowercase()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

fn parse_token_section(
    token: &str,
    sections: &mut HashMap<String, Script>,
    files: &mut Vec<Files>,
    app_order: &mut Vec<String>,
) -> Result<()> {
    let (head, body) = token.split_once('\n').ok_or_else(|| VesselError::RecipeParse {
        reason: format!("section {token} could not be split into section name and body"),
    })?;
    let head = head.trim();

    let key = section_name(head);

    // Files get their own representation so that multiple blocks survive.
    if key == "files" {
        let args = head
            .trim_start_matches('%')
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default();
        let mut block = Files { args, files: Vec::new() };
        for line in body.trim().lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = file_splitter()
                .find_iter(line)
                .map(|m| m.as_str())
                .collect();
            let (src, dst) = match parts.as_slice() {
                [] => continue,
                [src] => (*src, ""),
                [src, dst, ..] => (*src, *dst),
            };
            block.files.push(FileTransfer {
                src: unquote(src.trim()),
                dst: unquote(dst.trim()),
            });
        }
        // Blocks with identical args concatenate in order of appearance.
        match files.iter_mut().find(|f| f.args == block.args) {
            Some(existing) => existing.files.append(&mut block.files),
            None => files.push(block),
        }
        return Ok(());
    }

    if APP_SECTIONS.contains(&key.as_str()) {
        let mut words = head.trim_start_matches('%').split_whitespace();
        let _prefix = words.next();
        let app_name = words.next().ok_or_else(|| VesselError::RecipeParse {
            reason: format!(
                "app section {key} could not be split into section name and app name"
            ),
        })?;
        let stored = format!("{key} {app_name}");
        sections.entry(stored).or_default().script.push_str(body);
        if !app_order.iter().any(|a| a == app_name) {
            app_order.push(app_name.to_string());
        }
        return Ok(());
    }

    let entry = sections.entry(key).or_default();
    if let Some((_, rest)) = head.trim_start_matches('%').split_once(char::is_whitespace) {
        entry.args = rest.to_string();
    }
    entry.script.push_str(body);
    Ok(())
}

fn populate_definition(
    mut sections: HashMap<String, Script>,
    files: Vec<Files>,
    app_order: Vec<String>,
    def: &mut Definition,
) -> Result<()> {
    for name in VALID_SECTIONS {
        sections.entry((*name).to_string()).or_default();
    }

    let mut take = |name: &str| sections.remove(name).unwrap_or_default();

    // %test feeds both the image script and the build script.
    let test = take("test");

    def.labels = parse_labels(&take("labels").script);
    def.image_scripts.help = take("help");
    def.image_scripts.environment = take("environment");
    def.image_scripts.runscript = take("runscript");
    def.image_scripts.startscript = take("startscript");
    def.image_scripts.test = test.clone();
    def.build_scripts.arguments = take("arguments");
    def.build_scripts.pre = take("pre");
    def.build_scripts.setup = take("setup");
    def.build_scripts.post = take("post");
    def.build_scripts.test = test;
    def.files = files;
    def.app_order = app_order;
    // %files bodies live in the files blocks above; drop the seeded map
    // entry so only genuinely unknown keys remain behind.
    take("files");

    if !sections.is_empty() {
        let mut invalid: Vec<String> = sections
            .keys()
            .filter(|k| {
                let prefix = k.split_whitespace().next().unwrap_or_default();
                !APP_SECTIONS.contains(&prefix)
            })
            .cloned()
            .collect();
        invalid.sort();
        if !invalid.is_empty() {
            return Err(VesselError::InvalidSection { sections: invalid });
        }
        def.custom = sections
            .into_iter()
            .map(|(k, v)| (k, v.script))
            .collect();
    }

    if def.is_empty() {
        return Err(VesselError::EmptyDefinition);
    }
    Ok(())
}

fn parse_header(blob: &str, def: &mut Definition) -> Result<()> {
    let mut header: HashMap<String, String> = HashMap::new();
    // Pending (key, value) of a backslash continuation.
    let mut cont: Option<(String, String)> = None;

    for line in blob.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            if let Some((key, val)) = cont.take() {
                header.insert(key, val);
            }
            continue;
        }

        // Strip inline comments.
        let content = line.split('#').next().unwrap_or_default();

        let (key, val) = match cont.take() {
            Some((key, pending)) => (key, pending + content.trim()),
            None => {
                let (k, v) = content.split_once(':').ok_or_else(|| {
                    VesselError::InvalidHeader {
                        reason: format!("header key {} had no value", content.trim()),
                    }
                })?;
                (k.trim().to_lowercase(), v.trim().to_string())
            }
        };

        if let Some(stripped) = val.strip_suffix('\\') {
            let mut pending = stripped.to_string();
            // A literal `\n` at the end of the continued value becomes a
            // real newline.
            if let Some(without) = pending.strip_suffix("\\n") {
                pending = format!("{without}\n");
            }
            cont = Some((key, pending));
            continue;
        }

        validate_header_keyword(&key)?;
        header.insert(key, val);
    }

    if let Some((key, val)) = cont.take() {
        validate_header_keyword(&key)?;
        header.insert(key, val);
    }

    if !header.is_empty() {
        def.header = header;
    } else {
        debug!("no header values found in definition");
    }
    Ok(())
}

// A keyword must be in the closed set; `otherurl<N>` folds to `otherurl&n`
// for the check.
fn validate_header_keyword(key: &str) -> Result<()> {
    if VALID_HEADERS.contains(&key) {
        return Ok(());
    }
    let stripped = key.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped != key {
        let folded = format!("{stripped}&n");
        if VALID_HEADERS.contains(&folded.as_str()) {
            return Ok(());
        }
    }
    Err(VesselError::InvalidHeader {
        reason: format!("invalid header keyword found: {key}"),
    })
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"'))
            || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return s[1..s.len() - 1].to_string();
    }
    // Tolerate an unterminated opening quote the way the splitter emits it.
    s.trim_matches('"').trim_matches('\'').to_string()
}
