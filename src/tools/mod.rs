use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Failures of the external renderer/converter boundary. Captured process output
/// is carried verbatim so the caller can surface it.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: &'static str, timeout: Duration },

    #[error("{tool} exited with {status}\nstdout: {stdout}\nstderr: {stderr}")]
    Failed {
        tool: &'static str,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[error("{tool} finished without producing {path}")]
    MissingOutput { tool: &'static str, path: PathBuf },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Waits for the child within the time budget. On expiry the future is dropped
/// and `kill_on_drop` reaps the process, so no half-finished run lingers.
async fn wait_bounded(tool: &'static str, child: Child, limit: Duration) -> Result<(), ToolError> {
    match timeout(limit, child.wait_with_output()).await {
        Err(_) => Err(ToolError::Timeout { tool, timeout: limit }),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(output)) if !output.status.success() => Err(ToolError::Failed {
            tool,
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Ok(output)) => {
            debug!("{} finished: {}", tool, output.status);
            Ok(())
        }
    }
}

pub struct RendererTool {
    binary: PathBuf,
    timeout: Duration,
}

impl RendererTool {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Renders already-sanitized scene text. Runs with the uploads root as
    /// working directory so model-relative texture references resolve. The image
    /// goes to a staging path next to the scene file, never into the cache
    /// directory, so a cache lookup cannot observe it.
    pub async fn render(&self, scene_file: &Path, workdir: &Path) -> Result<Vec<u8>, ToolError> {
        let out_file = scene_file.with_extension("render.png");
        debug!(
            "Invoking renderer {} on {} (workdir {})",
            self.binary.display(),
            scene_file.display(),
            workdir.display()
        );

        let child = Command::new(&self.binary)
            .arg("--outfile")
            .arg(&out_file)
            .arg(scene_file)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        wait_bounded("renderer", child, self.timeout).await?;

        let bytes = tokio::fs::read(&out_file).await.map_err(|_| ToolError::MissingOutput {
            tool: "renderer",
            path: out_file.clone(),
        })?;
        if let Err(e) = tokio::fs::remove_file(&out_file).await {
            warn!("Failed to clean up {}: {}", out_file.display(), e);
        }
        Ok(bytes)
    }
}

pub struct ConverterTool {
    binary: PathBuf,
    timeout: Duration,
}

impl ConverterTool {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Converts the primary model file into scene text at `out_scene`. The
    /// produced text still has to go through the rewrite chain.
    pub async fn convert(&self, model_file: &Path, out_scene: &Path) -> Result<(), ToolError> {
        debug!(
            "Invoking converter {} on {}",
            self.binary.display(),
            model_file.display()
        );

        let child = Command::new(&self.binary)
            .arg(model_file)
            .arg(out_scene)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        wait_bounded("converter", child, self.timeout).await?;

        if tokio::fs::metadata(out_scene).await.is_err() {
            return Err(ToolError::MissingOutput {
                tool: "converter",
                path: out_scene.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn converter_success_requires_the_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.obj");
        tokio::fs::write(&model, b"o cube\n").await.unwrap();
        let out = dir.path().join("scene.pbrt");

        // `cp` behaves like a converter: reads the model, writes the scene
        let tool = ConverterTool::new("cp", Duration::from_secs(5));
        tool.convert(&model, &out).await.unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"o cube\n");
    }

    #[tokio::test]
    async fn exit_without_output_is_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ConverterTool::new("true", Duration::from_secs(5));
        let err = tool
            .convert(&dir.path().join("model.obj"), &dir.path().join("scene.pbrt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingOutput { tool: "converter", .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ConverterTool::new("false", Duration::from_secs(5));
        let err = tool
            .convert(&dir.path().join("model.obj"), &dir.path().join("scene.pbrt"))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { tool, status, .. } => {
                assert_eq!(tool, "converter");
                assert!(!status.success());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn overlong_invocations_are_cut_off() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-converter.sh");
        tokio::fs::write(&script, b"#!/bin/sh\nsleep 5\n").await.unwrap();
        let mut perms = tokio::fs::metadata(&script).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&script, perms).await.unwrap();

        let tool = ConverterTool::new(&script, Duration::from_millis(100));
        let err = tool
            .convert(&dir.path().join("model.obj"), &dir.path().join("scene.pbrt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { tool: "converter", .. }));
    }
}
