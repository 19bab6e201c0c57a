//! Stage that runs a configured program inside the pipeline environment.
//!
//! The stage prepares a launcher through the pipeline (environment, `PATH`
//! prefixes, addin contributions), runs the program from the build
//! directory with the progress PTY attached, and succeeds iff the program
//! exits zero. Whether the work is already done cannot be cheaply
//! determined, so `query` always reports not-completed.

use async_trait::async_trait;

use crate::errors::BuildError;
use crate::launcher::ProcessLauncher;
use crate::phase::Phase;
use crate::pipeline::progress::BuildProgress;
use crate::stage::{BuildStage, CompletionFlag};

pub struct CommandStage {
    phase: Phase,
    title: String,
    program: String,
    build_args: Vec<String>,
    clean_args: Option<Vec<String>>,
    completed: CompletionFlag,
}

impl CommandStage {
    /// Create a stage running `program` at `phase`.
    ///
    /// `phase` must carry exactly one primary bit.
    pub fn new(
        phase: Phase,
        title: impl Into<String>,
        program: impl Into<String>,
    ) -> Result<Self, BuildError> {
        if !phase.is_well_formed() {
            return Err(BuildError::InvalidArgument(format!(
                "command stage phase `{phase}` must carry exactly one primary phase bit"
            )));
        }

        Ok(Self {
            phase,
            title: title.into(),
            program: program.into(),
            build_args: Vec::new(),
            clean_args: None,
            completed: CompletionFlag::default(),
        })
    }

    /// Arguments passed to the program when building.
    pub fn with_build_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.build_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments passed to the program when cleaning. Without them, `clean`
    /// is a no-op.
    pub fn with_clean_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clean_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, progress: &BuildProgress, args: &[String]) -> Result<(), BuildError> {
        let pipeline = progress.pipeline();
        let cancellable = progress.cancellable();

        let mut launcher = ProcessLauncher::new();
        pipeline.prepare(&mut launcher, self.phase).await?;
        launcher.set_cwd(progress.builddir());
        launcher.append_arg(&self.program);
        launcher.append_args(args.iter().cloned());
        progress.setup_pty(&mut launcher)?;

        let mut subprocess = launcher.spawn()?;
        subprocess.wait_check(&cancellable).await
    }
}

#[async_trait]
impl BuildStage for CommandStage {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn kind(&self) -> &str {
        "command"
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

    async fn query(&self) -> Result<(), BuildError> {
        self.completed.set(false);
        Ok(())
    }

    async fn build(&self, progress: &BuildProgress) -> Result<(), BuildError> {
        self.run(progress, &self.build_args).await
    }

    async fn clean(&self, progress: &BuildProgress) -> Result<(), BuildError> {
        match &self.clean_args {
            Some(args) => self.run(progress, args).await,
            None => Ok(()),
        }
    }
}
