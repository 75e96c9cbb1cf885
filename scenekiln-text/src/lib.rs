use thiserror::Error;

/// Failure modes of the rewrite chain. Every rewrite is all-or-nothing: when one of
/// these is returned, the input text has not been modified.
#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("Unsafe path reference {path:?} in scene text")]
    SecurityViolation { path: String },

    #[error("Found {count} anonymous material definitions, renaming would be ambiguous")]
    AmbiguousRename { count: usize },

    #[error("Unbalanced scope delimiters (line {line})")]
    MalformedScope { line: usize },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

pub mod namespace;
pub mod paths;
pub mod scan;
pub mod textures;
pub mod transform;
