use std::fs;
use std::io::Read;
use std::path::Path;

use log::{info, warn};

use crate::scan::{self, Edit};
use crate::RewriteError;

const KNOWN_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tif", "tiff"];

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "png"),
    (b"\xff\xd8\xff", "jpg"),
    (b"GIF87a", "gif"),
    (b"GIF89a", "gif"),
    (b"BM", "bmp"),
    (b"II*\x00", "tif"),
    (b"MM\x00*", "tif"),
];

fn signature_extension(head: &[u8]) -> Option<&'static str> {
    // RIFF container: the WEBP tag sits after the chunk size
    if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return Some("webp");
    }
    SIGNATURES
        .iter()
        .find(|(magic, _)| head.len() >= magic.len() && &head[..magic.len()] == *magic)
        .map(|(_, ext)| *ext)
}

fn has_known_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn sniff_head(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let mut head = vec![0u8; 16];
    let mut file = fs::File::open(path)?;
    let mut filled = 0;
    while filled < head.len() {
        let read = file.read(&mut head[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    head.truncate(filled);
    Ok(head)
}

/// Deterministic (lexicographic) enumeration of a model's texture files. The
/// renderer and the placeholder tokens both rely on this ordering.
#[derive(Debug, Default)]
pub struct TextureIndex {
    files: Vec<String>,
}

impl TextureIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.files.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }
}

/// Gives extension-less texture files their extension by sniffing leading bytes,
/// renaming them on disk, then fixes the ordinal enumeration. Renames happen
/// before the ordering is fixed so that index-to-file mapping stays stable.
/// A file with an unrecognized signature keeps its bare name. A missing texture
/// directory yields an empty index; placeholders will then simply not resolve.
pub fn normalize_and_enumerate(texture_dir: &Path) -> Result<TextureIndex, RewriteError> {
    if !texture_dir.is_dir() {
        warn!("Texture directory {} does not exist", texture_dir.display());
        return Ok(TextureIndex::empty());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(texture_dir)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if has_known_extension(&name) {
            files.push(name);
            continue;
        }

        match signature_extension(&sniff_head(&entry.path())?) {
            Some(ext) => {
                let renamed = format!("{}.{}", name, ext);
                fs::rename(entry.path(), texture_dir.join(&renamed))?;
                info!("Renamed texture {} -> {} (signature match)", name, renamed);
                files.push(renamed);
            }
            None => {
                warn!("Unknown file signature for texture {}, leaving it unrenamed", name);
                files.push(name);
            }
        }
    }

    files.sort();
    Ok(TextureIndex { files })
}

/// Outcome of a placeholder pass. Unresolved tokens are left in the text; a scene
/// may legitimately reference fewer textures than exist, so this is not an error.
#[derive(Debug)]
pub struct Resolution {
    pub text: String,
    pub unresolved: Vec<String>,
}

/// Accepts the bare `*N` form and any path form whose final component is `*N`
/// (model-qualified or arbitrary prefix).
fn placeholder_index(value: &str) -> Option<usize> {
    let normalized = value.replace('\\', "/");
    let last = normalized.rsplit('/').next().unwrap_or(normalized.as_str());
    let digits = last.strip_prefix('*')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Replaces every placeholder token in a filename parameter with the concrete
/// model-relative path of the Nth enumerated texture file, in one pass.
pub fn resolve_placeholders(text: &str, model_id: &str, index: &TextureIndex) -> Resolution {
    let mut edits = Vec::new();
    let mut unresolved = Vec::new();

    for (range, value) in scan::filename_values(text) {
        let Some(ordinal) = placeholder_index(value) else {
            continue;
        };
        match index.get(ordinal) {
            Some(file) => edits.push(Edit {
                range,
                replacement: format!("{}/textures/{}", model_id, file),
            }),
            None => {
                warn!(
                    "Placeholder *{} is out of range ({} texture files), leaving {:?} untouched",
                    ordinal,
                    index.len(),
                    value
                );
                unresolved.push(value.to_string());
            }
        }
    }

    Resolution {
        text: scan::apply_edits(text, edits),
        unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(files: &[&str]) -> TextureIndex {
        TextureIndex {
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn filename_line(value: &str) -> String {
        format!("Texture \"t\" \"spectrum\" \"imagemap\" \"string filename\" \"{}\"\n", value)
    }

    #[test]
    fn all_three_placeholder_shapes_resolve() {
        let idx = index(&["a.png", "b.png"]);
        for shape in ["*1", "abc123/textures/*1", "some/other/prefix/*1"] {
            let res = resolve_placeholders(&filename_line(shape), "abc123", &idx);
            assert!(
                res.text.contains("\"abc123/textures/b.png\""),
                "shape {} did not resolve: {}",
                shape,
                res.text
            );
            assert!(res.unresolved.is_empty());
        }
    }

    #[test]
    fn same_index_resolves_identically_everywhere() {
        let idx = index(&["a.png"]);
        let text = format!("{}{}", filename_line("*0"), filename_line("tex/*0"));
        let res = resolve_placeholders(&text, "abc123", &idx);
        assert_eq!(res.text.matches("\"abc123/textures/a.png\"").count(), 2);
    }

    #[test]
    fn out_of_range_is_reported_and_left_untouched() {
        let idx = index(&["a.png"]);
        let res = resolve_placeholders(&filename_line("*7"), "abc123", &idx);
        assert!(res.text.contains("\"*7\""));
        assert_eq!(res.unresolved, vec!["*7".to_string()]);
    }

    #[test]
    fn ordinary_filenames_are_not_placeholders() {
        assert_eq!(placeholder_index("tex/wood.png"), None);
        assert_eq!(placeholder_index("*"), None);
        assert_eq!(placeholder_index("*2x"), None);
        assert_eq!(placeholder_index("*2"), Some(2));
        assert_eq!(placeholder_index("abc\\textures\\*3"), Some(3));
    }

    #[test]
    fn signatures_cover_the_fixed_table() {
        assert_eq!(signature_extension(b"\x89PNG\r\n\x1a\n\x00\x00"), Some("png"));
        assert_eq!(signature_extension(b"\xff\xd8\xff\xe0\x00\x10JFIF"), Some("jpg"));
        assert_eq!(signature_extension(b"GIF89a\x01\x00"), Some("gif"));
        assert_eq!(signature_extension(b"BM\x36\x00\x00\x00"), Some("bmp"));
        assert_eq!(signature_extension(b"RIFF\x24\x00\x00\x00WEBPVP8 "), Some("webp"));
        assert_eq!(signature_extension(b"II*\x00\x08\x00\x00\x00"), Some("tif"));
        assert_eq!(signature_extension(b"MM\x00*\x00\x00\x00\x08"), Some("tif"));
        assert_eq!(signature_extension(b"not an image"), None);
    }
}
