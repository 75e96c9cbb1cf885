use std::fs;
use std::path::Path;

use scenekiln_text::paths::{self, PathMode};
use scenekiln_text::transform::SceneTransform;
use scenekiln_text::{namespace, scan, textures, transform, RewriteError};

const PNG_HEAD: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', 0x00, 0x00, 0x00, 0x0d];

/// The full post-conversion chain: preamble strip, sanitize, namespacing,
/// placeholder resolution, then a transform pass over the result.
#[test]
fn converted_scene_survives_the_whole_chain() -> Result<(), anyhow::Error> {
    let uploads = tempfile::tempdir()?;
    let model_id = "deadbeef42";
    let texture_dir = uploads.path().join(model_id).join("textures");
    fs::create_dir_all(&texture_dir)?;
    fs::write(texture_dir.join("base"), PNG_HEAD)?;

    let converted = format!(
        concat!(
            "# converter banner\n",
            "# Textures\n",
            "Texture \"albedo\" \"spectrum\" \"imagemap\" \"string filename\" \"{root}/{id}/textures/*0\"\n",
            "MakeNamedMaterial \"\" \"string type\" \"matte\" \"texture Kd\" \"albedo\"\n",
            "AttributeBegin\n",
            "NamedMaterial \"\"\n",
            "Shape \"plymesh\" \"string filename\" \"{root}/{id}/mesh.ply\"\n",
            "AttributeEnd\n",
        ),
        root = uploads.path().display(),
        id = model_id,
    );

    let text = scan::strip_preamble(&converted);
    assert!(text.starts_with("# Textures\n"));

    let text = paths::sanitize(text, uploads.path(), PathMode::Relative)?;
    assert!(text.contains(&format!("\"{}/mesh.ply\"", model_id)));

    let prefix = namespace::prefix_for(model_id);
    assert_eq!(prefix, "deadbeef_");
    let text = namespace::rewrite(&text, &prefix)?;
    assert!(text.contains("MakeNamedMaterial \"deadbeef_noname_material\""));
    assert!(text.contains("NamedMaterial \"deadbeef_noname_material\""));
    assert!(text.contains("Texture \"deadbeef_albedo\""));

    let index = textures::normalize_and_enumerate(&texture_dir)?;
    assert_eq!(index.files(), &["base.png"]);
    let resolved = textures::resolve_placeholders(&text, model_id, &index);
    assert!(resolved.unresolved.is_empty());
    assert!(resolved
        .text
        .contains(&format!("\"{}/textures/base.png\"", model_id)));

    // applying the namespace pass again must be a no-op
    assert_eq!(namespace::rewrite(&resolved.text, &prefix)?, resolved.text);

    let transformed = transform::inject(
        &resolved.text,
        &SceneTransform {
            translate: Some([1.0, 0.0, 0.0]),
            ..Default::default()
        },
        uploads.path(),
    )?;
    assert!(transformed.contains("AttributeBegin\nTranslate 1 0 0\nNamedMaterial"));
    assert!(transformed.contains("# translate: 1 0 0"));
    Ok(())
}

#[test]
fn a_single_traversal_reference_poisons_the_document() {
    let scene = concat!(
        "Texture \"ok\" \"spectrum\" \"imagemap\" \"string filename\" \"tex/fine.png\"\n",
        "Shape \"plymesh\" \"string filename\" \"../../etc/passwd\"\n",
    );
    let err = paths::sanitize(scene, Path::new("/srv/uploads"), PathMode::Relative).unwrap_err();
    match err {
        RewriteError::SecurityViolation { path } => assert_eq!(path, "../../etc/passwd"),
        other => panic!("expected SecurityViolation, got {other:?}"),
    }
}

#[test]
fn ambiguous_rename_leaves_the_input_byte_for_byte_intact() {
    let scene = "MakeNamedMaterial \"\"\nMakeNamedMaterial \"\"\nNamedMaterial \"\"\n";
    let before = scene.to_string();
    assert!(matches!(
        namespace::rewrite(scene, "deadbeef_"),
        Err(RewriteError::AmbiguousRename { count: 2 })
    ));
    assert_eq!(scene, before);
}
