//! One-shot observable execution of a stage selection.
//!
//! A [`BuildProgress`] is created by the pipeline when a caller invokes
//! `build`, `clean`, or `purge`. It snapshots the matching stages, captures
//! the build directory and a duplicate of the caller's PTY fd, and spawns a
//! driver task that walks the stages in the order the operation requires:
//! forward for build, reverse for clean and purge.
//!
//! A progress supports exactly one operation. Its settlement can be awaited
//! any number of times; every waiter observes the same outcome.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::BuildError;
use crate::launcher::ProcessLauncher;
use crate::phase::Phase;
use crate::pipeline::{BuildPipeline, PipelineEvent};
use crate::reaper::DirectoryReaper;
use crate::stage::BuildStage;

/// The lifecycle action a driver performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverAction {
    Build,
    Clean,
    Purge,
}

type Fiber = Shared<BoxFuture<'static, Result<(), BuildError>>>;

/// Observable handle for a single build, clean, or purge.
pub struct BuildProgress {
    pipeline: Arc<BuildPipeline>,
    phase_mask: Phase,
    stages: Vec<Arc<dyn BuildStage>>,
    parallelism: Option<u32>,
    cancellable: CancellationToken,
    pty: Option<OwnedFd>,
    builddir: PathBuf,
    current: Mutex<Option<Arc<dyn BuildStage>>>,
    fiber: OnceLock<Fiber>,
}

impl BuildProgress {
    pub(crate) fn new(
        pipeline: Arc<BuildPipeline>,
        phase_mask: Phase,
        stages: Vec<Arc<dyn BuildStage>>,
        parallelism: Option<u32>,
        cancellable: CancellationToken,
        pty: Option<OwnedFd>,
    ) -> Self {
        let builddir = pipeline.builddir().to_path_buf();
        Self {
            pipeline,
            phase_mask,
            stages,
            parallelism,
            cancellable,
            pty,
            builddir,
            current: Mutex::new(None),
            fiber: OnceLock::new(),
        }
    }

    /// A progress whose settlement is already an error.
    pub(crate) fn rejected(
        pipeline: Arc<BuildPipeline>,
        phase_mask: Phase,
        error: BuildError,
    ) -> Arc<Self> {
        let progress = Arc::new(Self::new(
            pipeline,
            phase_mask,
            Vec::new(),
            None,
            CancellationToken::new(),
            None,
        ));
        let fiber: Fiber = futures::future::ready(Err(error)).boxed().shared();
        let _ = progress.fiber.set(fiber);
        progress
    }

    /// Assign the one operation this progress will observe and spawn its
    /// driver. A second assignment fails without spawning work.
    pub(crate) fn start(
        self: Arc<Self>,
        action: DriverAction,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), BuildError> {
        if self.fiber.get().is_some() {
            return Err(BuildError::NotInitialized);
        }

        let progress = self.clone();
        let handle = tokio::spawn(async move {
            let result = match action {
                DriverAction::Build => build_driver(&progress).await,
                DriverAction::Clean => clean_driver(&progress).await,
                DriverAction::Purge => purge_driver(&progress).await,
            };
            progress.pipeline.recompute_phase();
            drop(permit);
            result
        });

        let fiber: Fiber = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(BuildError::Io(format!("driver task failed: {err}"))),
            }
        }
        .boxed()
        .shared();

        if self.fiber.set(fiber).is_err() {
            return Err(BuildError::NotInitialized);
        }
        Ok(())
    }

    /// Await the driver's settlement. Safe to call any number of times;
    /// every call observes the same outcome. Fails with
    /// [`BuildError::NotInitialized`] when no operation was ever assigned.
    pub async fn wait(&self) -> Result<(), BuildError> {
        match self.fiber.get() {
            Some(fiber) => fiber.clone().await,
            None => Err(BuildError::NotInitialized),
        }
    }

    /// The pipeline this progress executes against.
    pub fn pipeline(&self) -> Arc<BuildPipeline> {
        self.pipeline.clone()
    }

    /// The phase mask the caller requested.
    pub fn phase_mask(&self) -> Phase {
        self.phase_mask
    }

    /// Caller-requested parallelism; `None` means the scheduler default.
    pub fn parallelism(&self) -> Option<u32> {
        self.parallelism
    }

    /// The build directory captured at construction.
    pub fn builddir(&self) -> &Path {
        &self.builddir
    }

    /// A shared handle to the cancellation token, for delegation.
    pub fn cancellable(&self) -> CancellationToken {
        self.cancellable.clone()
    }

    /// The stage the driver is currently on, if any.
    pub fn current_stage(&self) -> Option<Arc<dyn BuildStage>> {
        self.current.lock().unwrap().clone()
    }

    /// The current stage's phase, or [`Phase::NONE`] when idle.
    pub fn phase(&self) -> Phase {
        self.current_stage()
            .map(|stage| stage.phase())
            .unwrap_or(Phase::NONE)
    }

    /// Bind the PTY to the launcher's stdin, stdout, and stderr as three
    /// independent duplicates. A no-op when no PTY is held.
    pub fn setup_pty(&self, launcher: &mut ProcessLauncher) -> Result<(), BuildError> {
        let Some(pty) = &self.pty else {
            return Ok(());
        };

        for dest in 0..=2 {
            launcher.take_fd(pty.try_clone()?, dest);
        }
        Ok(())
    }

    /// Write a formatted message to the PTY. A no-op when no PTY is held.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        let Some(pty) = &self.pty else {
            return;
        };

        let message = args.to_string();
        write_all(pty, message.as_bytes());
    }

    fn set_current(&self, stage: Option<Arc<dyn BuildStage>>) {
        *self.current.lock().unwrap() = stage.clone();
        self.pipeline.emit(PipelineEvent::CurrentStageChanged {
            title: stage.as_ref().map(|s| s.title()),
            phase: self.phase(),
        });
    }
}

impl fmt::Debug for BuildProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildProgress")
            .field("phase_mask", &self.phase_mask)
            .field("stages", &self.stages.len())
            .field("builddir", &self.builddir)
            .field("started", &self.fiber.get().is_some())
            .finish()
    }
}

fn write_all(fd: &OwnedFd, mut bytes: &[u8]) {
    use std::os::fd::AsRawFd;

    while !bytes.is_empty() {
        let written = unsafe {
            libc::write(
                fd.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Walk the selected stages forward, skipping stages whose `query` reports
/// them already complete.
async fn build_driver(progress: &Arc<BuildProgress>) -> Result<(), BuildError> {
    crate::path::mkdir_with_parents(progress.builddir(), 0o750).await?;

    for stage in &progress.stages {
        if progress.cancellable.is_cancelled() {
            progress.set_current(None);
            return Err(BuildError::Cancelled);
        }

        progress.set_current(Some(stage.clone()));

        if let Err(err) = stage.query().await {
            warn!(stage = %stage.title(), error = %err, "stage query failed");
        }

        if stage.completed() {
            continue;
        }

        debug!(stage = %stage.title(), phase = %stage.phase(), "building stage");

        if let Err(err) = stage.build(progress).await {
            progress.set_current(None);
            return Err(err);
        }
        stage.set_completed(true);
    }

    progress.set_current(None);
    Ok(())
}

/// Walk the selected stages in reverse, reverting each.
async fn clean_driver(progress: &Arc<BuildProgress>) -> Result<(), BuildError> {
    for stage in progress.stages.iter().rev() {
        if progress.cancellable.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        stage.clean(progress).await?;
        stage.set_completed(false);
    }
    Ok(())
}

/// Walk the selected stages in reverse, purging each, then reap the build
/// directory's contents and the directory itself.
async fn purge_driver(progress: &Arc<BuildProgress>) -> Result<(), BuildError> {
    for stage in progress.stages.iter().rev() {
        if progress.cancellable.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        stage.purge(progress).await?;
        stage.set_completed(false);
    }

    let mut reaper = DirectoryReaper::new();
    reaper.add_directory(progress.builddir(), None);
    reaper.add_file(progress.builddir(), None);
    reaper.execute().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::{FromRawFd, RawFd};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed");
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn test_pipeline() -> (tempfile::TempDir, Arc<BuildPipeline>) {
        let dir = tempfile::tempdir().unwrap();
        let builddir = dir.path().join("_build");
        let pipeline = BuildPipeline::new(dir.path(), builddir);
        (dir, pipeline)
    }

    fn bare_progress(pipeline: &Arc<BuildPipeline>, pty: Option<OwnedFd>) -> Arc<BuildProgress> {
        Arc::new(BuildProgress::new(
            pipeline.clone(),
            Phase::BUILD,
            Vec::new(),
            None,
            CancellationToken::new(),
            pty,
        ))
    }

    #[tokio::test]
    async fn wait_without_operation_is_not_initialized() {
        let (_dir, pipeline) = test_pipeline();
        let progress = bare_progress(&pipeline, None);

        assert_eq!(progress.wait().await, Err(BuildError::NotInitialized));
    }

    #[tokio::test]
    async fn a_progress_supports_exactly_one_operation() {
        let (_dir, pipeline) = test_pipeline();
        let progress = bare_progress(&pipeline, None);

        let gate = Arc::new(tokio::sync::Semaphore::new(2));
        let first = gate.clone().try_acquire_owned().unwrap();
        let second = gate.clone().try_acquire_owned().unwrap();

        progress.clone().start(DriverAction::Build, first).unwrap();
        let err = progress
            .clone()
            .start(DriverAction::Clean, second)
            .unwrap_err();
        assert_eq!(err, BuildError::NotInitialized);

        progress.wait().await.unwrap();
    }

    #[tokio::test]
    async fn wait_observes_the_same_outcome_repeatedly() {
        let (_dir, pipeline) = test_pipeline();
        let progress = BuildProgress::rejected(
            pipeline,
            Phase::BUILD,
            BuildError::Io("boom".into()),
        );

        for _ in 0..3 {
            assert_eq!(progress.wait().await, Err(BuildError::Io("boom".into())));
        }
    }

    #[tokio::test]
    async fn setup_pty_binds_three_independent_fds() {
        let (_dir, pipeline) = test_pipeline();
        let (_read, write) = pipe();
        let progress = bare_progress(&pipeline, Some(write));

        let mut launcher = ProcessLauncher::new();
        progress.setup_pty(&mut launcher).unwrap();
        assert_eq!(launcher.bound_fds(), vec![0, 1, 2]);

        // The launcher's duplicates survive the progress.
        let raw: Vec<RawFd> = launcher
            .fds()
            .iter()
            .map(|(fd, _)| {
                use std::os::fd::AsRawFd;
                fd.as_raw_fd()
            })
            .collect();
        drop(progress);
        for fd in raw {
            let rc = unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) };
            assert_eq!(rc, 1);
        }
    }

    #[tokio::test]
    async fn setup_pty_without_pty_is_a_no_op() {
        let (_dir, pipeline) = test_pipeline();
        let progress = bare_progress(&pipeline, None);

        let mut launcher = ProcessLauncher::new();
        progress.setup_pty(&mut launcher).unwrap();
        assert!(launcher.bound_fds().is_empty());
    }

    #[tokio::test]
    async fn print_writes_to_the_pty() {
        let (_dir, pipeline) = test_pipeline();
        let (read, write) = pipe();
        let progress = bare_progress(&pipeline, Some(write));

        progress.print(format_args!("stage {} of {}\n", 1, 3));
        drop(progress);

        let mut output = String::new();
        std::fs::File::from(read).read_to_string(&mut output).unwrap();
        assert_eq!(output, "stage 1 of 3\n");
    }

    #[tokio::test]
    async fn print_without_pty_is_a_no_op() {
        let (_dir, pipeline) = test_pipeline();
        let progress = bare_progress(&pipeline, None);
        progress.print(format_args!("dropped"));
    }

    #[tokio::test]
    async fn phase_reports_none_when_idle() {
        let (_dir, pipeline) = test_pipeline();
        let progress = bare_progress(&pipeline, None);

        assert_eq!(progress.phase(), Phase::NONE);
        assert!(progress.current_stage().is_none());
    }
}
