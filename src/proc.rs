//! Parsing of `/proc/self/mountinfo`.
//!
//! The build engine consults the mount table in two places: the orchestrator
//! rejects `noexec` destinations before any work happens, and the FUSE
//! drivers poll for the appearance of their mount point.

use crate::error::{Result, VesselError};
use std::path::{Path, PathBuf};

/// Path of the per-process mount table.
pub const SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

/// One entry of a mountinfo table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    /// Mount point, octal escapes decoded.
    pub point: PathBuf,
    /// Per-mount options (`rw`, `noexec`, `nodev`, ...).
    pub options: Vec<String>,
    /// Filesystem type, from the post-separator fields.
    pub fs_type: String,
}

/// Read and parse a mountinfo table.
pub fn get_mount_info(path: &str) -> Result<Vec<MountInfoEntry>> {
    let content = std::fs::read_to_string(path).map_err(|e| VesselError::io(path, e))?;
    parse_mount_info(&content)
}

/// Parse mountinfo content.
///
/// Format per `proc(5)`:
/// `id parent major:minor root mountpoint options [optional...] - fstype source superopts`
pub fn parse_mount_info(content: &str) -> Result<Vec<MountInfoEntry>> {
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (head, tail) = match line.split_once(" - ") {
            Some(split) => split,
            None => {
                return Err(VesselError::Internal(format!(
                    "malformed mountinfo line: {line}"
                )))
            }
        };
        let fields: Vec<&str> = head.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(VesselError::Internal(format!(
                "malformed mountinfo line: {line}"
            )));
        }
        let fs_type = tail.split_whitespace().next().unwrap_or("").to_string();
        entries.push(MountInfoEntry {
            point: PathBuf::from(unescape(fields[4])),
            options: fields[5].split(',').map(str::to_string).collect(),
            fs_type,
        });
    }
    Ok(entries)
}

/// Find the mount entry a path resides on: the entry with the longest mount
/// point that is a prefix of `path`.
pub fn find_parent_entry<'a>(
    path: &Path,
    entries: &'a [MountInfoEntry],
) -> Result<&'a MountInfoEntry> {
    entries
        .iter()
        .filter(|e| path.starts_with(&e.point))
        .max_by_key(|e| e.point.as_os_str().len())
        .ok_or_else(|| VesselError::Internal(format!("no mount entry found for {path:?}")))
}

/// Whether the mount table at `path` contains an entry whose mount point
/// equals `target`.
pub fn is_mount_point(path: &str, target: &Path) -> Result<bool> {
    Ok(get_mount_info(path)?.iter().any(|e| e.point == target))
}

// Kernel escapes space, tab, newline and backslash as \040-style octal.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Some(v) = s
                .get(i + 1..i + 4)
                .and_then(|oct| u8::from_str_radix(oct, 8).ok())
            {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime - ext4 /dev/sda1 rw
40 22 8:2 / /tmp rw,nosuid,noexec - tmpfs tmpfs rw
61 22 0:45 / /mnt/data\\040dir rw - xfs /dev/sdb1 rw
";

    #[test]
    fn test_parse_basic_entries() {
        let entries = parse_mount_info(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].point, PathBuf::from("/"));
        assert_eq!(entries[0].fs_type, "ext4");
        assert!(entries[1].options.contains(&"noexec".to_string()));
    }

    #[test]
    fn test_unescapes_octal_in_mount_point() {
        let entries = parse_mount_info(SAMPLE).unwrap();
        assert_eq!(entries[2].point, PathBuf::from("/mnt/data dir"));
    }

    #[test]
    fn test_find_parent_entry_longest_prefix() {
        let entries = parse_mount_info(SAMPLE).unwrap();
        let entry = find_parent_entry(Path::new("/tmp/build-1/rootfs"), &entries).unwrap();
        assert_eq!(entry.point, PathBuf::from("/tmp"));
        let entry = find_parent_entry(Path::new("/home/user"), &entries).unwrap();
        assert_eq!(entry.point, PathBuf::from("/"));
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(parse_mount_info("not a mountinfo line\n").is_err());
    }

    #[test]
    fn test_self_mountinfo_parses() {
        // Every Linux process has a mount table with a root entry.
        let entries = get_mount_info(SELF_MOUNTINFO).unwrap();
        assert!(entries.iter().any(|e| e.point == PathBuf::from("/")));
    }
}
