use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use log::{info, warn};

use scenekiln_text::paths::{self, PathMode};
use scenekiln_text::transform::SceneTransform;
use scenekiln_text::{namespace, scan, textures, transform};

use crate::cache::{Fingerprint, RenderCache};
use crate::models::ModelStore;
use crate::tools::{ConverterTool, RendererTool};

/// Staging area for editor/upload submissions below the uploads root; the
/// renderer reads scene files from here, the cache never does.
const RENDER_STAGING_DIR: &str = ".render";

/// Composes the rewrite chain with the model store, the external tools and the
/// render cache.
pub struct ScenePipeline {
    store: Arc<ModelStore>,
    cache: Arc<RenderCache>,
    renderer: RendererTool,
    converter: ConverterTool,
}

impl ScenePipeline {
    pub fn new(
        store: Arc<ModelStore>,
        cache: Arc<RenderCache>,
        renderer: RendererTool,
        converter: ConverterTool,
    ) -> Self {
        Self {
            store,
            cache,
            renderer,
            converter,
        }
    }

    /// Converter output -> renderable scene text: preamble strip, path
    /// sanitization, identifier namespacing, texture placeholder resolution.
    /// Each step is all-or-nothing, so a typed failure leaves no partially
    /// rewritten scene file behind.
    pub async fn convert_model(&self, model_id: &str) -> Result<PathBuf, anyhow::Error> {
        let lock = self.store.lock(model_id);
        let _guard = lock.lock().await;

        let mut manifest = self.store.load_manifest(model_id)?;
        let model_dir = self.store.model_dir(model_id);
        let model_file = model_dir.join(&manifest.model_file);
        let raw_scene = model_dir.join("scene_raw.pbrt");

        self.converter.convert(&model_file, &raw_scene).await?;
        let raw_text = tokio::fs::read_to_string(&raw_scene)
            .await
            .with_context(|| format!("Reading converter output {}", raw_scene.display()))?;

        let text = scan::strip_preamble(&raw_text);
        let text = paths::sanitize(text, self.store.root(), PathMode::Relative)?;
        let text = namespace::rewrite(&text, &namespace::prefix_for(model_id))?;

        let index = textures::normalize_and_enumerate(&self.store.textures_dir(model_id))?;
        let resolution = textures::resolve_placeholders(&text, model_id, &index);
        if !resolution.unresolved.is_empty() {
            warn!(
                "Model {}: {} texture placeholder(s) stay unresolved",
                model_id,
                resolution.unresolved.len()
            );
        }

        let scene_file = self.store.scene_file(model_id);
        tokio::fs::write(&scene_file, resolution.text.as_bytes())
            .await
            .with_context(|| format!("Writing {}", scene_file.display()))?;
        let _ = tokio::fs::remove_file(&raw_scene).await;

        manifest.converted = true;
        self.store.save_manifest(model_id, &manifest)?;
        info!("Model {} converted -> {}", model_id, scene_file.display());
        Ok(scene_file)
    }

    /// Injects the transform into the converted scene text and stores the result
    /// under its own role suffix, leaving the pre-transform file untouched.
    pub async fn apply_transform(
        &self,
        model_id: &str,
        transform: &SceneTransform,
    ) -> Result<PathBuf, anyhow::Error> {
        if transform.is_empty() {
            bail!("No transform component given for model {}", model_id);
        }

        let lock = self.store.lock(model_id);
        let _guard = lock.lock().await;

        let mut manifest = self.store.load_manifest(model_id)?;
        if !manifest.converted {
            bail!("Model {} has no converted scene text yet", model_id);
        }

        let scene_file = self.store.scene_file(model_id);
        let text = tokio::fs::read_to_string(&scene_file)
            .await
            .with_context(|| format!("Reading {}", scene_file.display()))?;

        let transformed = transform::inject(&text, transform, self.store.root())?;

        let out_file = self.store.transformed_scene_file(model_id);
        tokio::fs::write(&out_file, transformed.as_bytes())
            .await
            .with_context(|| format!("Writing {}", out_file.display()))?;

        manifest.transformed = true;
        self.store.save_manifest(model_id, &manifest)?;
        info!("Model {} transformed -> {}", model_id, out_file.display());
        Ok(out_file)
    }

    /// Renders submitted scene bytes through the content-addressed cache. The
    /// fingerprint covers the exact submitted bytes; the renderer gets the
    /// sanitized form, written to a staging scene file under the uploads root.
    pub async fn render_submission(&self, submitted: &[u8]) -> Result<Arc<Vec<u8>>, anyhow::Error> {
        let fingerprint = Fingerprint::of(submitted);
        let text = std::str::from_utf8(submitted).context("Submitted scene text is not valid UTF-8")?;
        let sanitized = paths::sanitize(text, self.store.root(), PathMode::Relative)?;

        let staging_dir = self.store.root().join(RENDER_STAGING_DIR);
        let scene_file = staging_dir.join(format!("{}.pbrt", fingerprint.hex()));
        let workdir = self.store.root().to_path_buf();
        let renderer = &self.renderer;

        self.cache
            .render_gated(&fingerprint, || async move {
                tokio::fs::create_dir_all(&staging_dir).await?;
                tokio::fs::write(&scene_file, sanitized.as_bytes()).await?;
                let rendered = renderer.render(&scene_file, &workdir).await;
                let _ = tokio::fs::remove_file(&scene_file).await;
                Ok(rendered?)
            })
            .await
    }
}
