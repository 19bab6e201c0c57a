//! Stage that drives another pipeline to a phase.
//!
//! Composite projects link workspaces together by inserting a
//! [`LinkedPipelineStage`] into the outer pipeline: when the outer pipeline
//! reaches the stage's phase, the linked pipeline is driven to
//! `linked_phase` and the outer driver waits for its settlement.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::errors::BuildError;
use crate::phase::Phase;
use crate::pipeline::BuildPipeline;
use crate::pipeline::progress::BuildProgress;
use crate::stage::{BuildStage, CompletionFlag};

pub struct LinkedPipelineStage {
    linked: Arc<BuildPipeline>,
    phase: Phase,
    linked_phase: Phase,
    title: String,
    completed: CompletionFlag,
}

impl LinkedPipelineStage {
    /// Create a stage that drives `linked` to its install phase when the
    /// owning pipeline reaches `phase`.
    pub fn new(linked: Arc<BuildPipeline>, phase: Phase) -> Result<Self, BuildError> {
        Self::new_full(linked, phase, Phase::INSTALL)
    }

    /// Create a stage that drives `linked` to `linked_phase` when the
    /// owning pipeline reaches `phase`.
    pub fn new_full(
        linked: Arc<BuildPipeline>,
        phase: Phase,
        linked_phase: Phase,
    ) -> Result<Self, BuildError> {
        if !phase.is_well_formed() {
            return Err(BuildError::InvalidArgument(format!(
                "linked stage phase `{phase}` must carry exactly one primary phase bit"
            )));
        }
        if !linked_phase.is_well_formed() {
            return Err(BuildError::InvalidArgument(format!(
                "linked phase `{linked_phase}` must carry exactly one primary phase bit"
            )));
        }

        let title = format!("Build {}", linked.title());

        Ok(Self {
            linked,
            phase,
            linked_phase,
            title,
            completed: CompletionFlag::default(),
        })
    }

    /// The phase executed on the linked pipeline.
    pub fn linked_phase(&self) -> Phase {
        self.linked_phase
    }
}

#[async_trait]
impl BuildStage for LinkedPipelineStage {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn kind(&self) -> &str {
        "linked-workspace"
    }

    fn title(&self) -> String {
        self.title.clone()
    }

    fn completed(&self) -> bool {
        self.completed.get()
    }

    fn set_completed(&self, completed: bool) {
        self.completed.set(completed);
    }

    /// Queries the linked pipeline and records completion when it has
    /// already reached the linked phase.
    async fn query(&self) -> Result<(), BuildError> {
        let current = self.linked.query().await;
        self.completed.set(current.covers(self.linked_phase));
        Ok(())
    }

    async fn build(&self, progress: &BuildProgress) -> Result<(), BuildError> {
        debug!(project = %self.linked.project_dir().display(), "building linked pipeline");

        let cancellable = progress.cancellable().child_token();
        let linked_progress = self.linked.build(self.linked_phase, None, cancellable, None);
        linked_progress.wait().await
    }

    async fn clean(&self, progress: &BuildProgress) -> Result<(), BuildError> {
        debug!(project = %self.linked.project_dir().display(), "cleaning linked pipeline");

        let cancellable = progress.cancellable().child_token();
        let linked_progress = self.linked.clean(self.linked_phase, None, cancellable, None);
        linked_progress.wait().await
    }

    async fn purge(&self, progress: &BuildProgress) -> Result<(), BuildError> {
        debug!(project = %self.linked.project_dir().display(), "purging linked pipeline");

        let cancellable = progress.cancellable().child_token();
        let linked_progress = self.linked.purge(self.linked_phase, None, cancellable, None);
        linked_progress.wait().await
    }

    fn linked_pipeline(&self) -> Option<Arc<BuildPipeline>> {
        Some(self.linked.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(project: &str) -> Arc<BuildPipeline> {
        BuildPipeline::new(project, format!("{project}/_build"))
    }

    #[test]
    fn new_defaults_to_the_install_phase() {
        let linked = pipeline("/src/glib");
        let stage = LinkedPipelineStage::new(linked, Phase::BUILD).unwrap();

        assert_eq!(stage.phase(), Phase::BUILD);
        assert_eq!(stage.linked_phase(), Phase::INSTALL);
        assert_eq!(stage.kind(), "linked-workspace");
    }

    #[test]
    fn title_names_the_linked_project() {
        let linked = pipeline("/src/glib");
        let stage = LinkedPipelineStage::new(linked, Phase::BUILD).unwrap();
        assert_eq!(stage.title(), "Build glib");

        let titled = BuildPipeline::with_title("/src/glib", "/src/glib/_build", "GLib");
        let stage = LinkedPipelineStage::new(titled, Phase::BUILD).unwrap();
        assert_eq!(stage.title(), "Build GLib");
    }

    #[test]
    fn new_full_rejects_malformed_phases() {
        let linked = pipeline("/src/glib");
        assert!(
            LinkedPipelineStage::new_full(linked.clone(), Phase::NONE, Phase::INSTALL).is_err()
        );
        assert!(
            LinkedPipelineStage::new_full(
                linked.clone(),
                Phase::BUILD,
                Phase::CONFIGURE | Phase::BUILD
            )
            .is_err()
        );
        assert!(LinkedPipelineStage::new_full(linked, Phase::BUILD, Phase::BUILD).is_ok());
    }

    #[tokio::test]
    async fn query_tracks_the_linked_pipeline_phase() {
        let linked = pipeline("/src/glib");
        let stage = LinkedPipelineStage::new_full(linked.clone(), Phase::BUILD, Phase::INSTALL)
            .unwrap();

        // An empty linked pipeline reports FINAL, which covers INSTALL.
        stage.query().await.unwrap();
        assert!(stage.completed());
    }

    #[test]
    fn add_stage_rejects_a_self_link() {
        let outer = pipeline("/src/app");
        let stage = LinkedPipelineStage::new(outer.clone(), Phase::BUILD).unwrap();

        let err = outer.add_stage(Arc::new(stage)).unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }

    #[test]
    fn add_stage_rejects_a_transitive_cycle() {
        let outer = pipeline("/src/app");
        let middle = pipeline("/src/lib");

        // outer -> middle is fine.
        let stage = LinkedPipelineStage::new(middle.clone(), Phase::BUILD).unwrap();
        outer.add_stage(Arc::new(stage)).unwrap();

        // middle -> outer would close the loop.
        let back = LinkedPipelineStage::new(outer.clone(), Phase::BUILD).unwrap();
        let err = middle.add_stage(Arc::new(back)).unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }
}
