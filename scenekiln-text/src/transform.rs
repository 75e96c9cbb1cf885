use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use itertools::Itertools;
use log::debug;

use crate::paths::{self, PathMode};
use crate::scan::{self, Directive, SceneScan};
use crate::RewriteError;

/// A comment line directly above `AttributeBegin` containing this marker excludes
/// the scope from transform injection.
pub const OPT_OUT_MARKER: &str = "no-transform";

/// Composite transform; each component is absent or well-formed. Application
/// order is fixed: translate, rotate, scale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneTransform {
    pub translate: Option<[f32; 3]>,
    /// Angle in degrees plus rotation axis.
    pub rotate: Option<[f32; 4]>,
    pub scale: Option<[f32; 3]>,
}

impl SceneTransform {
    pub fn is_empty(&self) -> bool {
        self.translate.is_none() && self.rotate.is_none() && self.scale.is_none()
    }

    fn directive_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(t) = self.translate {
            lines.push(format!("Translate {}", t.iter().join(" ")));
        }
        if let Some(r) = self.rotate {
            lines.push(format!("Rotate {}", r.iter().join(" ")));
        }
        if let Some(s) = self.scale {
            lines.push(format!("Scale {}", s.iter().join(" ")));
        }
        lines
    }

    fn describe(component: Option<&[f32]>) -> String {
        match component {
            Some(values) => values.iter().join(" "),
            None => "none".to_string(),
        }
    }

    fn header_comment(&self) -> String {
        format!(
            "# Scene transform applied {}\n# translate: {}\n# rotate: {}\n# scale: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            Self::describe(self.translate.as_ref().map(|v| v.as_slice())),
            Self::describe(self.rotate.as_ref().map(|v| v.as_slice())),
            Self::describe(self.scale.as_ref().map(|v| v.as_slice())),
        )
    }
}

/// Block-boundary insertion can leave a scope close and the next scope open glued
/// on one line; split them back onto their own lines.
fn repair_scope_breaks(lines: Vec<String>) -> Vec<String> {
    let mut repaired = Vec::with_capacity(lines.len());
    for line in lines {
        let mut rest = line;
        loop {
            let glued = rest
                .find("AttributeEnd")
                .and_then(|end| rest[end..].find("AttributeBegin").map(|begin| end + begin));
            match glued {
                Some(pos) => {
                    repaired.push(rest[..pos].trim_end().to_string());
                    rest = rest[pos..].to_string();
                }
                None => {
                    repaired.push(rest);
                    break;
                }
            }
        }
    }
    repaired
}

/// Inserts the transform's directive block into every eligible scope: after the
/// last direct-body transform directive when the scope already carries one (so a
/// pre-existing composition order survives), directly after scope open otherwise.
/// Prepends a header comment recording the applied parameters, then runs the
/// result through the path sanitizer in relative mode, since injection operates
/// on converted text that may still carry absolute references.
pub fn inject(
    text: &str,
    transform: &SceneTransform,
    uploads_root: &Path,
) -> Result<String, RewriteError> {
    // repair glued delimiters up front as well, the scope tracker is line-based
    let repaired = repair_scope_breaks(scan::lines(text).iter().map(|line| line.text.to_string()).collect());
    let repaired_text = repaired.join("\n");

    let scan = SceneScan::parse(&repaired_text)?;
    let block = transform.directive_lines();

    // anchor line index -> directive lines inserted after it
    let mut insertions: HashMap<usize, Vec<String>> = HashMap::new();
    if !block.is_empty() {
        for scope in &scan.scopes {
            let opted_out = scope.open > 0
                && scan.lines[scope.open - 1].directive == Directive::Comment
                && scan.lines[scope.open - 1].text.contains(OPT_OUT_MARKER);
            if opted_out {
                debug!("Scope at line {} opted out of transform injection", scope.open + 1);
                continue;
            }

            let anchor = scope
                .body
                .iter()
                .rev()
                .find(|idx| scan.lines[**idx].directive == Directive::Transform)
                .copied()
                .unwrap_or(scope.open);
            insertions.entry(anchor).or_default().extend(block.iter().cloned());
        }
    }

    let mut lines: Vec<String> = Vec::with_capacity(scan.lines.len() + insertions.len() * block.len());
    for (idx, line) in scan.lines.iter().enumerate() {
        lines.push(line.text.to_string());
        if let Some(inserted) = insertions.get(&idx) {
            lines.extend(inserted.iter().cloned());
        }
    }
    let lines = repair_scope_breaks(lines);

    let body = lines.join("\n");
    let with_header = format!("{}{}\n", transform.header_comment(), body.trim_end_matches('\n'));

    paths::sanitize(&with_header, uploads_root, PathMode::Relative)
}
