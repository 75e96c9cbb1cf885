use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const MANIFEST_FILE: &str = "model.json";
/// Pipeline output scene files, distinguished by role.
pub const SCENE_FILE: &str = "scene.pbrt";
pub const TRANSFORMED_SCENE_FILE: &str = "scene_transformed.pbrt";
pub const TEXTURES_DIR: &str = "textures";

/// Per-model bookkeeping, stored as `model.json` inside the model directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    pub declared_type: String,
    pub format_tag: Option<String>,
    /// Primary model file, relative to the model directory.
    pub model_file: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub converted: bool,
    #[serde(default)]
    pub transformed: bool,
}

/// Uploads-root layout: one directory per model identifier with its manifest, an
/// optional `textures/` subdirectory and the pipeline output scene files.
pub struct ModelStore {
    root: PathBuf,
    // filesystem mutation (texture renames, scene writes) is serialized per model
    dir_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dir_locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    pub fn textures_dir(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(TEXTURES_DIR)
    }

    pub fn scene_file(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(SCENE_FILE)
    }

    pub fn transformed_scene_file(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(TRANSFORMED_SCENE_FILE)
    }

    pub fn lock(&self, model_id: &str) -> Arc<Mutex<()>> {
        self.dir_locks
            .entry(model_id.to_string())
            .or_default()
            .clone()
    }

    pub fn load_manifest(&self, model_id: &str) -> Result<ModelManifest, anyhow::Error> {
        let path = self.model_dir(model_id).join(MANIFEST_FILE);
        let data =
            std::fs::read(&path).with_context(|| format!("Reading manifest {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("Parsing manifest {}", path.display()))
    }

    pub fn save_manifest(&self, model_id: &str, manifest: &ModelManifest) -> Result<(), anyhow::Error> {
        let path = self.model_dir(model_id).join(MANIFEST_FILE);
        let data = serde_json::to_vec_pretty(manifest)?;
        std::fs::write(&path, data).with_context(|| format!("Writing manifest {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_with_status_flags() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = ModelStore::new(dir.path());
        std::fs::create_dir_all(store.model_dir("abc123"))?;

        let mut manifest = ModelManifest {
            name: "teapot".to_string(),
            declared_type: "model/obj".to_string(),
            format_tag: Some("obj".to_string()),
            model_file: "teapot.obj".to_string(),
            uploaded_at: Utc::now(),
            converted: false,
            transformed: false,
        };
        store.save_manifest("abc123", &manifest)?;

        manifest.converted = true;
        store.save_manifest("abc123", &manifest)?;

        let loaded = store.load_manifest("abc123")?;
        assert_eq!(loaded.name, "teapot");
        assert!(loaded.converted);
        assert!(!loaded.transformed);
        Ok(())
    }

    #[test]
    fn the_same_model_shares_one_lock() {
        let store = ModelStore::new("/tmp/does-not-matter");
        let a = store.lock("abc123");
        let b = store.lock("abc123");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &store.lock("other")));
    }
}
