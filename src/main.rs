use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use scenekiln_text::transform::SceneTransform;

use crate::cache::RenderCache;
use crate::models::ModelStore;
use crate::pipeline::ScenePipeline;
use crate::settings::{CliArgs, OperationMode};
use crate::tools::{ConverterTool, RendererTool};

mod cache;
mod models;
mod pipeline;
mod settings;
mod tools;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let args = CliArgs::parse();
    log::trace!("Starting with args: {:?}", args);

    let store = Arc::new(ModelStore::new(&args.uploads_dir));
    let cache = Arc::new(RenderCache::new(&args.cache_dir)?);
    let tool_timeout = Duration::from_secs(args.tool_timeout_secs);
    let pipeline = ScenePipeline::new(
        store,
        cache.clone(),
        RendererTool::new(&args.renderer_bin, tool_timeout),
        ConverterTool::new(&args.converter_bin, tool_timeout),
    );

    match args.operation_mode {
        OperationMode::Convert { model_id } => {
            let scene_file = pipeline.convert_model(&model_id).await?;
            log::info!("Converted model {} -> {}", model_id, scene_file.display());
        }
        OperationMode::Transform {
            model_id,
            translate,
            rotate,
            scale,
        } => {
            let transform = SceneTransform {
                translate: translate.map(Into::into),
                rotate: rotate.map(Into::into),
                scale: scale.map(Into::into),
            };
            let out_file = pipeline.apply_transform(&model_id, &transform).await?;
            log::info!("Transformed model {} -> {}", model_id, out_file.display());
        }
        OperationMode::Render { scene_file, out_file } => {
            let submitted = tokio::fs::read(&scene_file).await?;
            let image = pipeline.render_submission(&submitted).await?;
            let out_file = out_file.unwrap_or_else(|| format!("{}.png", scene_file));
            tokio::fs::write(&out_file, image.as_slice()).await?;
            log::info!("Rendered {} -> {}", scene_file, out_file);
        }
        OperationMode::Sweep { max_age_hours } => {
            let removed = cache.sweep(Duration::from_secs(max_age_hours * 3600)).await;
            log::info!("Sweep removed {} expired cache entries", removed);
        }
    }

    Ok(())
}
