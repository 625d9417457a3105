// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Mesh simplification (Blender in a container) and slicing (OrcaSlicer CLI).
//
// Both tools are opaque: success is exit code 0 and the expected output file
// existing afterwards.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use printline_core::PipelineConfig;
use printline_core::error::{PrintlineError, Result};

use crate::transport::{Transport, shell_quote};

/// Formats the simplification script can import.
pub const MODEL_EXTENSIONS: [&str; 5] = ["obj", "glb", "gltf", "stl", "ply"];

const TOOL_TIMEOUT: Duration = Duration::from_secs(600);
const SLICE_TIMEOUT: Duration = Duration::from_secs(300);

/// Output lines kept for error reports.
const TAIL_LINES: usize = 20;

pub fn is_model(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MODEL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// File-name-safe form of a project label.
pub fn label_stem(label: &str) -> String {
    let base = label.strip_suffix(".zip").unwrap_or(label);
    let stem: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_-.".contains(c) { c } else { '_' })
        .collect();
    if stem.is_empty() { "scan".to_owned() } else { stem }
}

/// Extract `archive` into `into` and return the first model entry.
pub fn extract_model(archive: &Path, into: &Path) -> Result<PathBuf> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| {
        PrintlineError::Protocol(format!("{} is not a zip archive: {e}", archive.display()))
    })?;
    zip.extract(into)
        .map_err(|e| PrintlineError::Io(std::io::Error::other(format!("extract: {e}"))))?;

    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| PrintlineError::Protocol(format!("corrupt archive entry {i}: {e}")))?;
        if let Some(rel) = entry.enclosed_name().filter(|p| is_model(p)) {
            let model = into.join(rel);
            info!(model = %model.display(), "model extracted");
            return Ok(model);
        }
    }
    Err(PrintlineError::Protocol(format!(
        "no model file found in {}",
        archive.display()
    )))
}

/// Runs the mesh tools through a transport (normally the local host).
pub struct MeshTools {
    transport: Arc<dyn Transport>,
    local_dir: PathBuf,
    blender_image: String,
    ratio: f64,
    faces: Option<u64>,
    slicer_bin: String,
}

impl MeshTools {
    pub fn new(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Self {
        Self {
            transport,
            local_dir: config.local_dir.clone(),
            blender_image: config.blender_image.clone(),
            ratio: config.decimate_ratio,
            faces: config.decimate_faces,
            slicer_bin: config.slicer_bin.clone(),
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.local_dir.join("models")
    }

    /// Path of `local` as seen inside the container, where the pipeline
    /// directory is mounted at `/data`.
    fn container_path(&self, local: &Path) -> Result<String> {
        let rel = local.strip_prefix(&self.local_dir).map_err(|_| {
            PrintlineError::Tool {
                tool: "blender".into(),
                detail: format!(
                    "{} is outside {}",
                    local.display(),
                    self.local_dir.display()
                ),
            }
        })?;
        Ok(format!("/data/{}", rel.to_string_lossy()))
    }

    pub fn decimate_command(&self, model: &Path, output: &Path) -> Result<String> {
        let mut cmd = format!(
            "docker run --rm -v {}:/data {} blender -b -noaudio -P /data/scripts/decimate_and_export.py -- --ratio {}",
            shell_quote(&self.local_dir.to_string_lossy()),
            shell_quote(&self.blender_image),
            self.ratio
        );
        if let Some(faces) = self.faces {
            cmd.push_str(&format!(" --nfaces {faces}"));
        }
        cmd.push_str(&format!(
            " --inm {} --outm {}",
            shell_quote(&self.container_path(model)?),
            shell_quote(&self.container_path(output)?)
        ));
        Ok(cmd)
    }

    /// Decimate `model` to `<models>/<label>_decimated.stl`.
    #[instrument(skip(self, model), fields(model = %model.display()))]
    pub async fn simplify(&self, model: &Path, label: &str) -> Result<PathBuf> {
        let output = self
            .models_dir()
            .join(format!("{}_decimated.stl", label_stem(label)));
        let cmd = self.decimate_command(model, &output)?;
        self.run_tool("blender", &cmd, TOOL_TIMEOUT, &output).await?;
        Ok(output)
    }

    pub fn slice_command(&self, stl: &Path, output: &Path) -> String {
        let profiles = self.local_dir.join("profiles");
        let machine = profiles.join("x1c_machine.json");
        let process = profiles.join("x1c_process.json");
        let filament = profiles.join("x1c_filament.json");

        // Layer-gcode validation in the CLI only passes at debug level 5.
        let mut cmd = format!(
            "{} --debug 5 --no-check --slice 0",
            shell_quote(&self.slicer_bin)
        );
        if machine.is_file() && process.is_file() {
            cmd.push_str(&format!(
                " --load-settings {}",
                shell_quote(&format!("{};{}", machine.display(), process.display()))
            ));
        }
        if filament.is_file() {
            cmd.push_str(&format!(
                " --load-filaments {}",
                shell_quote(&filament.to_string_lossy())
            ));
        }
        cmd.push_str(&format!(
            " {} --export-3mf {}",
            shell_quote(&stl.to_string_lossy()),
            shell_quote(&output.to_string_lossy())
        ));
        cmd
    }

    /// Slice `stl` to `<models>/<label>.3mf`.
    #[instrument(skip(self, stl), fields(stl = %stl.display()))]
    pub async fn slice(&self, stl: &Path, label: &str) -> Result<PathBuf> {
        let output = self.models_dir().join(format!("{}.3mf", label_stem(label)));
        let cmd = self.slice_command(stl, &output);
        self.run_tool("orca-slicer", &cmd, SLICE_TIMEOUT, &output).await?;
        Ok(output)
    }

    async fn run_tool(&self, tool: &str, cmd: &str, timeout: Duration, output: &Path) -> Result<()> {
        debug!(tool, command = cmd, "running");
        let mut session = self.transport.exec(cmd, timeout).await?;
        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        while let Some(line) = session.next_line().await {
            debug!(tool, "{line}");
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        let code = session.wait().await?;
        if code != 0 {
            return Err(PrintlineError::Tool {
                tool: tool.to_owned(),
                detail: format!(
                    "exit code {code}: {}",
                    tail.back().map(String::as_str).unwrap_or("")
                ),
            });
        }
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(PrintlineError::Tool {
                tool: tool.to_owned(),
                detail: format!("exited 0 but {} was not created", output.display()),
            });
        }
        info!(tool, output = %output.display(), "tool finished");
        Ok(())
    }
}
