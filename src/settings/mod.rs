use clap::{Parser, Subcommand, value_parser};
use itertools::Itertools;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(name = "Scenekiln")]
#[command(version)]
#[command(about = "Scene-text rewrite pipeline and content-addressed render cache")]
pub struct CliArgs {
    #[arg(long, env = "SCENEKILN_UPLOADS_DIR", default_value_t = default_uploads_dir())]
    pub uploads_dir: String,

    #[arg(long, env = "SCENEKILN_CACHE_DIR", default_value_t = default_cache_dir())]
    pub cache_dir: String,

    #[arg(long, env = "SCENEKILN_RENDERER_BIN", default_value = "pbrt")]
    pub renderer_bin: String,

    #[arg(long, env = "SCENEKILN_CONVERTER_BIN", default_value = "obj2pbrt")]
    pub converter_bin: String,

    #[arg(
        long,
        default_value_t = 600,
        help = "Upper bound in seconds for one renderer/converter invocation"
    )]
    pub tool_timeout_secs: u64,

    #[command(subcommand)]
    pub operation_mode: OperationMode,
}

pub fn default_uploads_dir() -> String {
    std::env::current_dir()
        .expect("Can't read current working directory!")
        .join("_uploads")
        .to_string_lossy()
        .to_string()
}

pub fn default_cache_dir() -> String {
    std::env::current_dir()
        .expect("Can't read current working directory!")
        .join("_cache")
        .to_string_lossy()
        .to_string()
}

#[derive(Subcommand, Debug)]
pub enum OperationMode {
    /// Convert an uploaded model and rewrite the resulting scene text
    Convert { model_id: String },
    /// Inject a transform into a converted model's scene text
    Transform {
        model_id: String,
        #[arg(long, value_parser = value_parser!(Vector3))]
        translate: Option<Vector3>,
        #[arg(long, value_parser = value_parser!(Rotation), help = "Angle in degrees plus rotation axis")]
        rotate: Option<Rotation>,
        #[arg(long, value_parser = value_parser!(Vector3))]
        scale: Option<Vector3>,
    },
    /// Render a scene text file through the content-addressed cache
    Render {
        scene_file: String,
        #[arg(long)]
        out_file: Option<String>,
    },
    /// Delete cached renders older than the retention window
    Sweep {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
}

fn trim_brackets(input: &str) -> &str {
    let mut chars = input.chars();
    chars.next(); // skip first
    chars.next_back(); // skip last
    chars.as_str()
}

// (a, b, c) with any whitespace
fn parse_components(s: &str, expected: usize) -> Result<Vec<f32>, String> {
    let string: String = s.chars().filter(|&c| !c.is_whitespace()).collect();
    if !string.starts_with("(") || !string.ends_with(")") {
        return Err("Missing start or end bracket".to_string());
    }

    let trimmed_str = trim_brackets(string.as_str());
    let splits = trimmed_str.split(',').collect_vec();

    if splits.len() != expected {
        return Err(format!(
            "Comma splitting resulted in {} splits, not {}!",
            splits.len(),
            expected
        ));
    }

    splits
        .iter()
        .map(|&split| {
            split
                .parse::<f32>()
                .map_err(|e| format!("Failed to parse component {:?}: {}", split, e))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl FromStr for Vector3 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = parse_components(s, 3)?;
        Ok(Vector3 {
            x: components[0],
            y: components[1],
            z: components[2],
        })
    }
}

impl From<Vector3> for [f32; 3] {
    fn from(v: Vector3) -> Self {
        [v.x, v.y, v.z]
    }
}

/// (angle, x, y, z) rotation argument
#[derive(Debug, Clone)]
pub struct Rotation {
    pub angle: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl FromStr for Rotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = parse_components(s, 4)?;
        Ok(Rotation {
            angle: components[0],
            x: components[1],
            y: components[2],
            z: components[3],
        })
    }
}

impl From<Rotation> for [f32; 4] {
    fn from(r: Rotation) -> Self {
        [r.angle, r.x, r.y, r.z]
    }
}
