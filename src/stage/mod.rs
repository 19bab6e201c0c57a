//! Build stage contract.
//!
//! A stage is one polymorphic unit of pipeline work. Every stage exposes
//! `query`, `build`, `clean`, and `purge`; the defaults succeed as no-ops so
//! implementations override only what they need. Concurrency guarantees
//! against re-entry come from the pipeline driver, not the stage.

pub mod command;
pub mod linked;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::BuildError;
use crate::phase::Phase;
use crate::pipeline::BuildPipeline;
use crate::pipeline::progress::BuildProgress;

/// Compiler flags resolved for a single file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildFlags {
    pub flags: Vec<String>,
    /// Directory the flags are relative to, usually the build directory.
    pub directory: Option<PathBuf>,
}

/// Cached completion bit embedded by stage implementations.
///
/// The bit is the driver's fast path: a completed stage is skipped without
/// invoking `build`. A stage that cannot cheaply determine completion must
/// leave the bit false.
#[derive(Debug, Default)]
pub struct CompletionFlag(AtomicBool);

impl CompletionFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, completed: bool) {
        self.0.store(completed, Ordering::Release);
    }
}

/// One unit of work in a build pipeline.
#[async_trait]
pub trait BuildStage: Send + Sync {
    /// The stage's primary phase plus any modifier bits. Exactly one primary
    /// bit must be set; `BuildPipeline::add_stage` rejects anything else.
    fn phase(&self) -> Phase;

    /// Tag identifying the stage implementation, e.g. `"command"`.
    fn kind(&self) -> &str;

    fn title(&self) -> String;

    fn completed(&self) -> bool;

    fn set_completed(&self, completed: bool);

    /// Refresh the completion cache. May perform I/O but must not mutate the
    /// pipeline. Failures are advisory: the driver logs them and continues.
    async fn query(&self) -> Result<(), BuildError> {
        Ok(())
    }

    /// Perform the stage's work. The driver records completion on success.
    async fn build(&self, _progress: &BuildProgress) -> Result<(), BuildError> {
        Ok(())
    }

    /// Revert the side effects of `build`.
    async fn clean(&self, _progress: &BuildProgress) -> Result<(), BuildError> {
        Ok(())
    }

    /// Remove persistent state, potentially more aggressively than `clean`.
    async fn purge(&self, _progress: &BuildProgress) -> Result<(), BuildError> {
        Ok(())
    }

    /// Introspect compiler flags for `file`.
    async fn find_build_flags(&self, _file: &Path) -> Result<BuildFlags, BuildError> {
        Err(BuildError::NotSupported(format!(
            "stage `{}` does not provide build flags",
            self.kind()
        )))
    }

    /// The pipeline this stage drives, when it embeds one. Used to keep the
    /// linked-pipeline graph acyclic.
    fn linked_pipeline(&self) -> Option<Arc<BuildPipeline>> {
        None
    }
}
