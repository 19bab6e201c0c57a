//! Build pipeline core for the Foundry IDE backend.
//!
//! A [`pipeline::BuildPipeline`] is an ordered collection of
//! [`stage::BuildStage`]s, each tagged with a [`phase::Phase`] drawn from a
//! bit-flag taxonomy. Callers request a phase-masked `build`, `clean`, or
//! `purge`; the pipeline selects the matching stages, spawns a driver task,
//! and immediately returns a [`pipeline::progress::BuildProgress`] that can
//! be awaited, observed, and cancelled.
//!
//! Stage subprocesses run through a [`launcher::ProcessLauncher`] populated
//! with the pipeline's environment and, when the caller supplied one, the
//! progress's PTY bound to their stdio. Composite projects embed other
//! pipelines with [`stage::linked::LinkedPipelineStage`].

pub mod errors;
pub mod launcher;
pub mod manager;
pub mod path;
pub mod phase;
pub mod pipeline;
pub mod reaper;
pub mod stage;

pub use errors::BuildError;
pub use launcher::{ProcessLauncher, Subprocess};
pub use manager::{BuildManager, ManagerEvent, PipelineManifest, StageManifest};
pub use phase::Phase;
pub use pipeline::progress::BuildProgress;
pub use pipeline::{BuildAddin, BuildPipeline, PipelineEvent};
pub use reaper::DirectoryReaper;
pub use stage::command::CommandStage;
pub use stage::linked::LinkedPipelineStage;
pub use stage::{BuildFlags, BuildStage, CompletionFlag};
