use std::path::Path;

use log::trace;

use crate::scan::{self, Edit};
use crate::RewriteError;

/// Target form for filename parameters: relative to the uploads root (what the
/// renderer expects, it runs with the uploads root as working directory), or
/// absolute (for tools invoked without a working directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    Relative,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Relative and free of escape patterns.
    SafeRelative,
    /// Absolute but under the uploads root, rewritable to a root-relative path.
    RootedAbsolute,
    /// Traversal, home-relative, UNC/drive or system path.
    Suspicious,
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Classifies one filename parameter value. `root` must already be slash-normalized
/// and free of a trailing slash.
pub fn classify_reference(value: &str, root: &str) -> PathClass {
    if value.starts_with("\\\\") {
        return PathClass::Suspicious;
    }

    let normalized = value.replace('\\', "/");
    if normalized.starts_with('~') || has_drive_prefix(&normalized) {
        return PathClass::Suspicious;
    }
    if normalized.split('/').any(|component| component == "..") {
        return PathClass::Suspicious;
    }

    if normalized.starts_with('/') {
        return if !root.is_empty() && normalized.starts_with(&format!("{}/", root)) {
            PathClass::RootedAbsolute
        } else {
            // covers /etc, /usr and friends: every absolute path outside the
            // uploads root escapes it, system prefixes are not special-cased
            PathClass::Suspicious
        };
    }

    PathClass::SafeRelative
}

/// Scans every `"string filename"` parameter (placeholder tokens included). Any
/// suspicious reference rejects the whole document before a single rewrite happens;
/// otherwise rooted-absolute values are re-anchored and separators normalized.
/// Pure text transformation, never touches disk.
pub fn sanitize(text: &str, uploads_root: &Path, mode: PathMode) -> Result<String, RewriteError> {
    let root = uploads_root.to_string_lossy().replace('\\', "/");
    let root = root.trim_end_matches('/');

    let values = scan::filename_values(text);

    for (_, value) in &values {
        if classify_reference(value, root) == PathClass::Suspicious {
            return Err(RewriteError::SecurityViolation {
                path: value.to_string(),
            });
        }
    }

    let mut edits = Vec::new();
    for (range, value) in values {
        let normalized = value.replace('\\', "/");
        let rewritten = match classify_reference(value, root) {
            PathClass::RootedAbsolute => {
                let relative = normalized[root.len()..].trim_start_matches('/').to_string();
                match mode {
                    PathMode::Relative => relative,
                    PathMode::Absolute => normalized,
                }
            }
            PathClass::SafeRelative => match mode {
                PathMode::Relative => normalized,
                PathMode::Absolute => format!("{}/{}", root, normalized),
            },
            PathClass::Suspicious => unreachable!("rejected above"),
        };

        if rewritten != value {
            trace!("Rewriting filename reference {:?} -> {:?}", value, rewritten);
            edits.push(Edit {
                range,
                replacement: rewritten,
            });
        }
    }

    Ok(scan::apply_edits(text, edits))
}
