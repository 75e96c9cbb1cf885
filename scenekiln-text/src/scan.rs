use std::ops::Range;

use crate::RewriteError;

/// Marker line emitted by the converter; everything above it is converter preamble
/// that the rewrite chain discards.
pub const TEXTURES_MARKER: &str = "# Textures";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    ScopeBegin,
    ScopeEnd,
    /// Translate / Rotate / Scale
    Transform,
    Shape,
    LightSource,
    CoordSysTransform,
    Texture,
    MakeNamedMaterial,
    NamedMaterial,
    Comment,
    Blank,
    Other,
}

pub fn classify(line: &str) -> Directive {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return Directive::Blank;
    }
    if trimmed.starts_with('#') {
        return Directive::Comment;
    }

    match trimmed.split_whitespace().next().unwrap_or("") {
        "AttributeBegin" => Directive::ScopeBegin,
        "AttributeEnd" => Directive::ScopeEnd,
        "Translate" | "Rotate" | "Scale" => Directive::Transform,
        "Shape" => Directive::Shape,
        "LightSource" => Directive::LightSource,
        "CoordSysTransform" => Directive::CoordSysTransform,
        "Texture" => Directive::Texture,
        "MakeNamedMaterial" => Directive::MakeNamedMaterial,
        "NamedMaterial" => Directive::NamedMaterial,
        _ => Directive::Other,
    }
}

#[derive(Debug)]
pub struct Line<'a> {
    /// Line content without the trailing line break.
    pub text: &'a str,
    /// Byte offset of the line start within the scanned document.
    pub start: usize,
    pub directive: Directive,
}

/// One `AttributeBegin`/`AttributeEnd` pair. `body` holds the direct (non-nested)
/// body line indices, excluding the delimiter lines themselves.
#[derive(Debug)]
pub struct Scope {
    pub open: usize,
    pub close: usize,
    pub depth: usize,
    pub body: Vec<usize>,
}

#[derive(Debug)]
pub struct SceneScan<'a> {
    pub lines: Vec<Line<'a>>,
    pub scopes: Vec<Scope>,
}

/// Tokenizes a document into classified lines with their document offsets.
pub fn lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for raw in text.split_inclusive('\n') {
        let content = raw.trim_end_matches(['\n', '\r']);
        lines.push(Line {
            text: content,
            start,
            directive: classify(content),
        });
        start += raw.len();
    }
    lines
}

impl<'a> SceneScan<'a> {
    /// Single pass over the document: tokenize per line and track scope nesting with
    /// an explicit stack, recording each scope's direct-body span as we go.
    pub fn parse(text: &'a str) -> Result<SceneScan<'a>, RewriteError> {
        let lines = lines(text);

        let mut scopes = Vec::new();
        let mut stack: Vec<(usize, Vec<usize>)> = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            match line.directive {
                Directive::ScopeBegin => stack.push((idx, Vec::new())),
                Directive::ScopeEnd => {
                    let Some((open, body)) = stack.pop() else {
                        return Err(RewriteError::MalformedScope { line: idx + 1 });
                    };
                    scopes.push(Scope {
                        open,
                        close: idx,
                        depth: stack.len(),
                        body,
                    });
                }
                _ => {
                    if let Some((_, body)) = stack.last_mut() {
                        body.push(idx);
                    }
                }
            }
        }

        if let Some((open, _)) = stack.last() {
            return Err(RewriteError::MalformedScope { line: open + 1 });
        }

        // popping orders scopes innermost-first, but callers want document order
        scopes.sort_by_key(|scope| scope.open);
        Ok(SceneScan { lines, scopes })
    }
}

/// A single planned replacement of a byte range of the original document.
#[derive(Debug)]
pub struct Edit {
    pub range: Range<usize>,
    pub replacement: String,
}

/// Applies an immutable edit plan in one pass. Edits must not overlap; they are
/// computed against the original text, so later edits never see mutated input.
pub fn apply_edits(text: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|edit| edit.range.start);

    let mut out = String::with_capacity(text.len() + 64);
    let mut cursor = 0;
    for edit in edits {
        debug_assert!(edit.range.start >= cursor, "overlapping edits in plan");
        out.push_str(&text[cursor..edit.range.start]);
        out.push_str(&edit.replacement);
        cursor = edit.range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Quoted string values of one line, as (inner value range, inner value) pairs.
/// Ranges are relative to the line.
pub fn quoted_spans(line: &str) -> Vec<(Range<usize>, &str)> {
    let mut spans = Vec::new();
    let mut rest = 0;
    while let Some(open) = line[rest..].find('"') {
        let value_start = rest + open + 1;
        let Some(close) = line[value_start..].find('"') else {
            break; // dangling quote, ignore the tail
        };
        let value_end = value_start + close;
        spans.push((value_start..value_end, &line[value_start..value_end]));
        rest = value_end + 1;
    }
    spans
}

/// All `"string filename"` parameter values of the document, as
/// (inner value range, inner value) pairs with document-global ranges.
pub fn filename_values(text: &str) -> Vec<(Range<usize>, &str)> {
    const KEY: &str = "\"string filename\"";

    let mut values = Vec::new();
    let bytes = text.as_bytes();
    let mut from = 0;
    while let Some(pos) = text[from..].find(KEY) {
        let mut i = from + pos + KEY.len();
        while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b'[') {
            i += 1;
        }
        from = i;
        if i < bytes.len() && bytes[i] == b'"' {
            if let Some(close) = text[i + 1..].find('"') {
                let (start, end) = (i + 1, i + 1 + close);
                values.push((start..end, &text[start..end]));
                from = end + 1;
            }
        }
    }
    values
}

/// Drops the converter preamble: returns the document from the `# Textures`
/// marker line onwards, or the whole document when no marker is present.
pub fn strip_preamble(text: &str) -> &str {
    let mut start = 0;
    for raw in text.split_inclusive('\n') {
        if raw.trim_end().trim_start() == TEXTURES_MARKER {
            return &text[start..];
        }
        start += raw.len();
    }
    text
}
