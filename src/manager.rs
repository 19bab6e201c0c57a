//! Pipeline loading and invalidation.
//!
//! This module provides:
//! - `PipelineManifest` / `StageManifest`, the declarative JSON description
//!   of a project's pipeline
//! - Loading functions for the manifest file
//! - `BuildManager`, which owns the loaded pipeline for a project and emits
//!   `pipeline-invalidated` when its inputs change
//!
//! The manager caches the loaded pipeline; listeners that observe an
//! invalidation call [`BuildManager::load_pipeline`] again to reload.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::path;
use crate::phase::Phase;
use crate::pipeline::BuildPipeline;
use crate::stage::command::CommandStage;

/// Manifest location relative to the project directory.
pub const PIPELINE_MANIFEST: &str = ".foundry/pipeline.json";

/// Declarative description of one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageManifest {
    /// Primary phase (plus optional modifiers), e.g. `"configure"` or
    /// `"build|after"`.
    pub phase: Phase,
    /// Human-readable title; defaults to "Run <program>".
    #[serde(default)]
    pub title: Option<String>,
    /// Program resolved through the pipeline environment.
    pub program: String,
    /// Arguments for the build action.
    #[serde(default)]
    pub build_args: Vec<String>,
    /// Arguments for the clean action; omitted means clean is a no-op.
    #[serde(default)]
    pub clean_args: Option<Vec<String>>,
}

/// Declarative description of a project's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineManifest {
    /// Project title used for linked-stage naming.
    #[serde(default)]
    pub title: Option<String>,
    /// Build directory; `~`- and `$HOME`-prefixed values are expanded,
    /// relative values are anchored at the project directory.
    pub builddir: String,
    /// Environment applied to every stage subprocess.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Program-path prefixes applied to every stage subprocess.
    #[serde(default)]
    pub path: Vec<PathBuf>,
    #[serde(default)]
    pub stages: Vec<StageManifest>,
}

impl PipelineManifest {
    /// Load a manifest from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline manifest: {}", path.display()))?;

        let manifest: PipelineManifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline manifest: {}", path.display()))?;

        Ok(manifest)
    }

    /// Save the manifest to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize pipeline manifest")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write pipeline manifest: {}", path.display()))?;

        Ok(())
    }

    /// Resolve the build directory against a project directory.
    pub fn resolve_builddir(&self, project_dir: &Path) -> PathBuf {
        if self.builddir.starts_with('~') || self.builddir.starts_with("$HOME") {
            return path::expand(&self.builddir);
        }
        let builddir = PathBuf::from(&self.builddir);
        if builddir.is_absolute() {
            builddir
        } else {
            project_dir.join(builddir)
        }
    }

    /// Instantiate a pipeline from this manifest.
    pub fn into_pipeline(self, project_dir: &Path) -> Result<Arc<BuildPipeline>> {
        let builddir = self.resolve_builddir(project_dir);

        let pipeline = match &self.title {
            Some(title) => BuildPipeline::with_title(project_dir, builddir, title.clone()),
            None => BuildPipeline::new(project_dir, builddir),
        };

        for (key, value) in &self.env {
            pipeline.setenv(key.clone(), value.clone());
        }
        for dir in &self.path {
            pipeline.prepend_path(dir.clone());
        }

        for stage in self.stages {
            let title = stage
                .title
                .clone()
                .unwrap_or_else(|| format!("Run {}", stage.program));

            let mut command = CommandStage::new(stage.phase, title, stage.program)
                .context("Invalid stage in pipeline manifest")?
                .with_build_args(stage.build_args);
            if let Some(clean_args) = stage.clean_args {
                command = command.with_clean_args(clean_args);
            }

            pipeline
                .add_stage(Arc::new(command))
                .context("Failed to add stage from pipeline manifest")?;
        }

        Ok(pipeline)
    }
}

/// Events emitted by the build manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    /// The pipeline's inputs changed; the cached pipeline was dropped and
    /// must be reloaded.
    PipelineInvalidated,
}

/// Owns the loaded pipeline for one project.
pub struct BuildManager {
    project_dir: PathBuf,
    pipeline: Mutex<Option<Arc<BuildPipeline>>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl BuildManager {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            project_dir: project_dir.into(),
            pipeline: Mutex::new(None),
            events,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// The manifest path for this project.
    pub fn manifest_path(&self) -> PathBuf {
        self.project_dir.join(PIPELINE_MANIFEST)
    }

    /// Load the project's pipeline, reusing the cached instance when the
    /// manifest has not been invalidated since the previous load.
    pub fn load_pipeline(&self) -> Result<Arc<BuildPipeline>> {
        if let Some(pipeline) = self.pipeline.lock().unwrap().clone() {
            return Ok(pipeline);
        }

        let manifest = PipelineManifest::load(&self.manifest_path())?;
        let pipeline = manifest.into_pipeline(&self.project_dir)?;

        *self.pipeline.lock().unwrap() = Some(pipeline.clone());
        Ok(pipeline)
    }

    /// Drop the cached pipeline and notify listeners that it must be
    /// reloaded.
    pub fn invalidate(&self) {
        let previous = self.pipeline.lock().unwrap().take();
        if let Some(pipeline) = previous {
            pipeline.emit(crate::pipeline::PipelineEvent::Invalidated);
        }
        let _ = self.events.send(ManagerEvent::PipelineInvalidated);
    }
}
