//! Ordered, phased collection of build stages.
//!
//! The pipeline owns its stages in insertion order and turns phase-masked
//! requests into one-shot [`progress::BuildProgress`] executions. It also
//! carries the build environment every stage subprocess inherits: `setenv`
//! entries, `PATH` prefixes, and the contributions of registered
//! [`BuildAddin`]s.
//!
//! Concurrency contract: at most one driver runs on a pipeline at a time. A
//! `build`/`clean`/`purge` issued while another operation is in flight
//! returns a progress that is already rejected. Stage mutation is only
//! permitted while no driver is in flight; that part of the contract is the
//! caller's to uphold.

pub mod progress;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::BuildError;
use crate::launcher::ProcessLauncher;
use crate::phase::Phase;
use crate::stage::BuildStage;
use progress::{BuildProgress, DriverAction};

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Events emitted to pipeline observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A stage was appended to the pipeline.
    StageAdded { title: String, phase: Phase },
    /// A stage was removed from the pipeline.
    StageRemoved { title: String },
    /// The pipeline's overall phase changed.
    PhaseChanged { phase: Phase },
    /// A driver moved to a new stage (or finished, with `title == None`).
    CurrentStageChanged { title: Option<String>, phase: Phase },
    /// The pipeline's inputs changed and it must be reloaded.
    Invalidated,
}

/// A registered contributor to the pipeline's build environment.
///
/// Addins decorate launchers during [`BuildPipeline::prepare`], typically to
/// front-load `PATH` entries or inject compiler-wrapper variables for
/// operations up to a given phase.
#[async_trait]
pub trait BuildAddin: Send + Sync {
    async fn prepare(
        &self,
        launcher: &mut ProcessLauncher,
        phase: Phase,
    ) -> Result<(), BuildError>;
}

/// Ordered container of build stages with a shared build directory and
/// environment.
pub struct BuildPipeline {
    id: u64,
    title: Option<String>,
    project_dir: PathBuf,
    builddir: PathBuf,
    stages: RwLock<Vec<Arc<dyn BuildStage>>>,
    env: RwLock<BTreeMap<String, String>>,
    path_prefixes: RwLock<Vec<PathBuf>>,
    addins: RwLock<Vec<Arc<dyn BuildAddin>>>,
    phase: AtomicU32,
    events: broadcast::Sender<PipelineEvent>,
    driver_gate: Arc<Semaphore>,
    // Handed to progresses so stages reach the pipeline through them.
    self_weak: Weak<BuildPipeline>,
}

impl BuildPipeline {
    pub fn new(project_dir: impl Into<PathBuf>, builddir: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_options(project_dir.into(), builddir.into(), None)
    }

    pub fn with_title(
        project_dir: impl Into<PathBuf>,
        builddir: impl Into<PathBuf>,
        title: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_options(project_dir.into(), builddir.into(), Some(title.into()))
    }

    fn with_options(
        project_dir: PathBuf,
        builddir: PathBuf,
        title: Option<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|self_weak| Self {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            title,
            project_dir,
            builddir,
            stages: RwLock::new(Vec::new()),
            env: RwLock::new(BTreeMap::new()),
            path_prefixes: RwLock::new(Vec::new()),
            addins: RwLock::new(Vec::new()),
            phase: AtomicU32::new(Phase::NONE.bits()),
            events,
            driver_gate: Arc::new(Semaphore::new(1)),
            self_weak: self_weak.clone(),
        })
    }

    fn strong(&self) -> Arc<BuildPipeline> {
        self.self_weak
            .upgrade()
            .expect("a live pipeline always has a strong reference")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The project title, falling back to the project directory's basename
    /// sanitized to UTF-8.
    pub fn title(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        self.project_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.project_dir.to_string_lossy().into_owned())
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// The absolute build directory path.
    pub fn builddir(&self) -> &Path {
        &self.builddir
    }

    /// Subscribe to pipeline observer events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    /// Append a stage.
    ///
    /// Rejects stages whose phase does not carry exactly one primary bit,
    /// and linked stages whose transitive pipeline chain would reach back to
    /// this pipeline.
    pub fn add_stage(&self, stage: Arc<dyn BuildStage>) -> Result<(), BuildError> {
        if !stage.phase().is_well_formed() {
            return Err(BuildError::InvalidArgument(format!(
                "stage `{}` must carry exactly one primary phase bit",
                stage.title()
            )));
        }

        self.ensure_acyclic(&stage)?;

        let event = PipelineEvent::StageAdded {
            title: stage.title(),
            phase: stage.phase(),
        };
        self.stages.write().unwrap().push(stage);
        self.emit(event);
        Ok(())
    }

    fn ensure_acyclic(&self, stage: &Arc<dyn BuildStage>) -> Result<(), BuildError> {
        let mut queue: Vec<Arc<BuildPipeline>> = stage.linked_pipeline().into_iter().collect();
        let mut seen: HashSet<u64> = HashSet::new();

        while let Some(pipeline) = queue.pop() {
            if pipeline.id == self.id {
                return Err(BuildError::InvalidArgument(format!(
                    "stage `{}` would link this pipeline to itself",
                    stage.title()
                )));
            }
            if seen.insert(pipeline.id) {
                for nested in pipeline.stages() {
                    queue.extend(nested.linked_pipeline());
                }
            }
        }
        Ok(())
    }

    /// Remove a stage by identity. Returns whether anything was removed.
    pub fn remove_stage(&self, stage: &Arc<dyn BuildStage>) -> bool {
        let mut stages = self.stages.write().unwrap();
        let before = stages.len();
        stages.retain(|existing| !Arc::ptr_eq(existing, stage));
        let removed = stages.len() != before;
        drop(stages);

        if removed {
            self.emit(PipelineEvent::StageRemoved {
                title: stage.title(),
            });
        }
        removed
    }

    /// Snapshot of the stages in insertion order.
    pub fn stages(&self) -> Vec<Arc<dyn BuildStage>> {
        self.stages.read().unwrap().clone()
    }

    pub fn add_addin(&self, addin: Arc<dyn BuildAddin>) {
        self.addins.write().unwrap().push(addin);
    }

    /// Set an environment variable applied to every launcher.
    pub fn setenv(&self, key: impl Into<String>, value: impl Into<String>) {
        self.env.write().unwrap().insert(key.into(), value.into());
    }

    /// Add a program-path prefix applied to every launcher.
    pub fn prepend_path(&self, dir: impl Into<PathBuf>) {
        self.path_prefixes.write().unwrap().push(dir.into());
    }

    /// The highest primary phase for which all matching stages have
    /// completed, per the last `query` or driver run.
    pub fn phase(&self) -> Phase {
        Phase::from_bits_retain(self.phase.load(Ordering::Acquire))
    }

    /// Populate a launcher with the pipeline environment and the
    /// contributions of registered addins up to `phase`.
    pub async fn prepare(
        &self,
        launcher: &mut ProcessLauncher,
        phase: Phase,
    ) -> Result<(), BuildError> {
        {
            let env = self.env.read().unwrap();
            for (key, value) in env.iter() {
                launcher.setenv(key.clone(), value.clone());
            }
        }
        {
            let prefixes = self.path_prefixes.read().unwrap();
            for dir in prefixes.iter() {
                launcher.prepend_path(dir.clone());
            }
        }

        let addins: Vec<Arc<dyn BuildAddin>> = self.addins.read().unwrap().clone();
        for addin in addins {
            addin.prepare(launcher, phase).await?;
        }
        Ok(())
    }

    /// Resolve a program name within the pipeline's environment: the `PATH`
    /// prefixes first, then the inherited search path.
    pub async fn contains_program(&self, name: &str) -> Result<PathBuf, BuildError> {
        if name.contains('/') {
            let candidate = PathBuf::from(name);
            if is_executable(&candidate).await {
                return Ok(candidate);
            }
            return Err(BuildError::NotFound(name.into()));
        }

        let mut dirs: Vec<PathBuf> = self.path_prefixes.read().unwrap().clone();
        let inherited = self
            .env
            .read()
            .unwrap()
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        dirs.extend(std::env::split_paths(&inherited));

        for dir in dirs {
            let candidate = dir.join(name);
            if is_executable(&candidate).await {
                return Ok(candidate);
            }
        }

        Err(BuildError::NotFound(name.into()))
    }

    /// Run `query` on every stage and rederive the overall phase. Stage
    /// failures are advisory and logged.
    pub async fn query(&self) -> Phase {
        let stages = self.stages();
        for stage in &stages {
            if let Err(err) = stage.query().await {
                warn!(stage = %stage.title(), error = %err, "stage query failed");
            }
        }
        self.recompute_phase()
    }

    /// Rederive the overall phase from the cached completion bits.
    pub(crate) fn recompute_phase(&self) -> Phase {
        let stages = self.stages();
        let mut reached = Phase::NONE;

        for phase in Phase::primaries() {
            let all_completed = stages
                .iter()
                .filter(|stage| stage.phase().mask() == phase)
                .all(|stage| stage.completed());
            if !all_completed {
                break;
            }
            reached = phase;
        }

        let previous = self.phase.swap(reached.bits(), Ordering::AcqRel);
        if previous != reached.bits() {
            self.emit(PipelineEvent::PhaseChanged { phase: reached });
        }
        reached
    }

    /// Build every stage selected by `phase_mask`, in insertion order.
    ///
    /// Returns immediately with a progress observing the driver.
    /// `parallelism` is `None` for the scheduler default; stages that fan
    /// out jobs may consult it. `pty_fd` is duplicated into the progress
    /// when present.
    pub fn build(
        &self,
        phase_mask: Phase,
        parallelism: Option<u32>,
        cancellable: CancellationToken,
        pty_fd: Option<BorrowedFd<'_>>,
    ) -> Arc<BuildProgress> {
        self.launch(DriverAction::Build, phase_mask, parallelism, cancellable, pty_fd)
    }

    /// Clean every stage selected by `phase_mask`, in reverse order.
    pub fn clean(
        &self,
        phase_mask: Phase,
        parallelism: Option<u32>,
        cancellable: CancellationToken,
        pty_fd: Option<BorrowedFd<'_>>,
    ) -> Arc<BuildProgress> {
        self.launch(DriverAction::Clean, phase_mask, parallelism, cancellable, pty_fd)
    }

    /// Purge every stage selected by `phase_mask`, in reverse order, then
    /// reap the build directory.
    pub fn purge(
        &self,
        phase_mask: Phase,
        parallelism: Option<u32>,
        cancellable: CancellationToken,
        pty_fd: Option<BorrowedFd<'_>>,
    ) -> Arc<BuildProgress> {
        self.launch(DriverAction::Purge, phase_mask, parallelism, cancellable, pty_fd)
    }

    fn launch(
        &self,
        action: DriverAction,
        phase_mask: Phase,
        parallelism: Option<u32>,
        cancellable: CancellationToken,
        pty_fd: Option<BorrowedFd<'_>>,
    ) -> Arc<BuildProgress> {
        if phase_mask.mask().is_empty() {
            return BuildProgress::rejected(
                self.strong(),
                phase_mask,
                BuildError::InvalidArgument("phase mask selects no primary phase".into()),
            );
        }

        let permit = match self.driver_gate.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return BuildProgress::rejected(
                    self.strong(),
                    phase_mask,
                    BuildError::InvalidArgument(
                        "another operation is already in flight on this pipeline".into(),
                    ),
                );
            }
        };

        let pty = pty_fd.and_then(|fd| match fd.try_clone_to_owned() {
            Ok(owned) => Some(owned),
            Err(err) => {
                warn!(error = %err, "failed to duplicate pty fd, continuing without one");
                None
            }
        });

        let stages: Vec<Arc<dyn BuildStage>> = self
            .stages()
            .into_iter()
            .filter(|stage| stage.phase().matches(phase_mask))
            .collect();

        let progress = Arc::new(BuildProgress::new(
            self.strong(),
            phase_mask,
            stages,
            parallelism,
            cancellable,
            pty,
        ));

        match progress.clone().start(action, permit) {
            Ok(()) => progress,
            Err(err) => BuildProgress::rejected(self.strong(), phase_mask, err),
        }
    }
}

impl std::fmt::Debug for BuildPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildPipeline")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("builddir", &self.builddir)
            .field("phase", &self.phase())
            .field("stages", &self.stages.read().unwrap().len())
            .finish()
    }
}

async fn is_executable(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && has_exec_bit(&metadata),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn has_exec_bit(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn has_exec_bit(_metadata: &std::fs::Metadata) -> bool {
    true
}
