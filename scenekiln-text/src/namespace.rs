use std::collections::HashMap;

use log::trace;

use crate::scan::{self, Directive, Edit};
use crate::RewriteError;

/// Name synthesized for the single permitted anonymous material definition.
pub const ANONYMOUS_MATERIAL_NAME: &str = "noname_material";

/// Derives the namespace prefix from a model identifier: its first 8 characters
/// plus a separator. Converted scenes from different models can then be composed
/// without identifier collisions.
pub fn prefix_for(model_id: &str) -> String {
    let short: String = model_id.chars().take(8).collect();
    format!("{}_", short)
}

struct Definition {
    line_idx: usize,
    /// Document-global byte range of the quoted name value.
    name_range: std::ops::Range<usize>,
    name: String,
}

fn collect_definitions(lines: &[scan::Line<'_>], directive: Directive) -> Vec<Definition> {
    let mut definitions = Vec::new();
    for (line_idx, line) in lines.iter().enumerate() {
        if line.directive != directive {
            continue;
        }
        if let Some((range, name)) = scan::quoted_spans(line.text).into_iter().next() {
            definitions.push(Definition {
                line_idx,
                name_range: line.start + range.start..line.start + range.end,
                name: name.to_string(),
            });
        }
    }
    definitions
}

/// Prefixes every material and texture identifier that does not yet carry the
/// prefix, consistently at definition and reference sites. All-or-nothing: the
/// rename plan is computed in full before a single byte changes, and any error
/// leaves the input untouched.
///
/// A lone anonymous material (`MakeNamedMaterial ""`) gets a synthesized name;
/// more than one makes renaming ambiguous and aborts the rewrite. Reference
/// sites of the anonymous material are recognized by their own directive keyword
/// (`NamedMaterial ""`), which cannot be confused with the defining occurrence.
pub fn rewrite(text: &str, prefix: &str) -> Result<String, RewriteError> {
    let lines = scan::lines(text);

    let material_defs = collect_definitions(&lines, Directive::MakeNamedMaterial);
    let texture_defs = collect_definitions(&lines, Directive::Texture);

    let anonymous_count = material_defs.iter().filter(|def| def.name.is_empty()).count();
    if anonymous_count > 1 {
        return Err(RewriteError::AmbiguousRename {
            count: anonymous_count,
        });
    }
    let synthesized_name = format!("{}{}", prefix, ANONYMOUS_MATERIAL_NAME);

    // Phase one: rename maps. Already-prefixed names stay out, which is what makes
    // the whole rewrite idempotent.
    let mut material_renames: HashMap<&str, String> = HashMap::new();
    for def in &material_defs {
        if !def.name.is_empty() && !def.name.starts_with(prefix) {
            material_renames.insert(&def.name, format!("{}{}", prefix, def.name));
        }
    }
    let mut texture_renames: HashMap<&str, String> = HashMap::new();
    for def in &texture_defs {
        if !def.name.is_empty() && !def.name.starts_with(prefix) {
            texture_renames.insert(&def.name, format!("{}{}", prefix, def.name));
        }
    }

    // Phase two: one immutable edit plan over the original text.
    let mut edits = Vec::new();

    for def in &material_defs {
        let new_name = if def.name.is_empty() {
            Some(synthesized_name.clone())
        } else {
            material_renames.get(def.name.as_str()).cloned()
        };
        if let Some(replacement) = new_name {
            trace!(
                "Renaming material definition {:?} -> {:?} (line {})",
                def.name,
                replacement,
                def.line_idx + 1
            );
            edits.push(Edit {
                range: def.name_range.clone(),
                replacement,
            });
        }
    }
    for def in &texture_defs {
        if let Some(replacement) = texture_renames.get(def.name.as_str()) {
            edits.push(Edit {
                range: def.name_range.clone(),
                replacement: replacement.clone(),
            });
        }
    }

    for line in &lines {
        // material reference sites carry their own keyword
        if line.directive == Directive::NamedMaterial {
            if let Some((range, name)) = scan::quoted_spans(line.text).into_iter().next() {
                let replacement = if name.is_empty() && anonymous_count == 1 {
                    Some(synthesized_name.clone())
                } else {
                    material_renames.get(name).cloned()
                };
                if let Some(replacement) = replacement {
                    edits.push(Edit {
                        range: line.start + range.start..line.start + range.end,
                        replacement,
                    });
                }
            }
        }

        // texture reference sites: a quoted value whose preceding parameter
        // declaration reads `"texture <param>"`, on any directive line
        let spans = scan::quoted_spans(line.text);
        for window in spans.windows(2) {
            let (_, key) = &window[0];
            let (range, value) = &window[1];
            if !key.starts_with("texture ") {
                continue;
            }
            if let Some(replacement) = texture_renames.get(value) {
                edits.push(Edit {
                    range: line.start + range.start..line.start + range.end,
                    replacement: replacement.clone(),
                });
            }
        }
    }

    Ok(scan::apply_edits(text, edits))
}
