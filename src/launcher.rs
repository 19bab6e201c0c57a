//! Child-process launcher plumbing.
//!
//! [`ProcessLauncher`] accumulates argv, environment variables, `PATH`
//! prefixes, a working directory, and stdio fd bindings, then spawns a
//! [`Subprocess`]. The pipeline populates launchers through
//! [`crate::pipeline::BuildPipeline::prepare`] so every stage subprocess sees
//! the same build environment, and a progress attaches its PTY through
//! [`crate::pipeline::progress::BuildProgress::setup_pty`].

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::errors::BuildError;

/// Accumulates the pieces of a child process before it is spawned.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    path_prefixes: Vec<PathBuf>,
    cwd: Option<PathBuf>,
    fds: Vec<(OwnedFd, RawFd)>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single argument. The first argument is the program.
    pub fn append_arg(&mut self, arg: impl Into<String>) {
        self.argv.push(arg.into());
    }

    /// Append a sequence of arguments.
    pub fn append_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
    }

    /// Append one formatted argument, e.g.
    /// `launcher.append_formatted(format_args!("-j{jobs}"))`.
    pub fn append_formatted(&mut self, args: fmt::Arguments<'_>) {
        self.argv.push(args.to_string());
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Set an environment variable for the child.
    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Add a directory to the front of the child's program search path.
    /// Earlier insertions stay earlier in the final `PATH`.
    pub fn prepend_path(&mut self, dir: impl Into<PathBuf>) {
        self.path_prefixes.push(dir.into());
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = Some(cwd.into());
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Bind an owned fd to one of the child's stdio slots
    /// (0 = stdin, 1 = stdout, 2 = stderr). The launcher owns the fd from
    /// here on and closes it when dropped unspawned.
    pub fn take_fd(&mut self, fd: OwnedFd, dest_fd: RawFd) {
        self.fds.push((fd, dest_fd));
    }

    /// The stdio slots with an fd bound, in binding order.
    pub fn bound_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(|(_, dest)| *dest).collect()
    }

    #[cfg(test)]
    pub(crate) fn fds(&self) -> &[(OwnedFd, RawFd)] {
        &self.fds
    }

    /// The `PATH` the child will observe: prefixes in insertion order,
    /// then the inherited search path.
    pub fn search_path(&self) -> String {
        let inherited = self
            .env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();

        let mut parts: Vec<String> = self
            .path_prefixes
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if !inherited.is_empty() {
            parts.push(inherited);
        }
        parts.join(":")
    }

    /// Spawn the child process.
    pub fn spawn(mut self) -> Result<Subprocess, BuildError> {
        let Some(program) = self.argv.first().cloned() else {
            return Err(BuildError::InvalidArgument(
                "launcher has no program to spawn".into(),
            ));
        };

        let mut command = Command::new(&program);
        command.args(&self.argv[1..]);

        for (key, value) in &self.env {
            command.env(key, value);
        }
        if !self.path_prefixes.is_empty() {
            command.env("PATH", self.search_path());
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        for (fd, dest) in self.fds.drain(..) {
            match dest {
                0 => command.stdin(Stdio::from(fd)),
                1 => command.stdout(Stdio::from(fd)),
                2 => command.stderr(Stdio::from(fd)),
                other => {
                    return Err(BuildError::InvalidArgument(format!(
                        "fd destination {other} is not a stdio slot"
                    )));
                }
            };
        }

        command.kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|err| BuildError::Io(format!("failed to spawn `{program}`: {err}")))?;

        Ok(Subprocess { child })
    }
}

/// A spawned child process.
#[derive(Debug)]
pub struct Subprocess {
    child: Child,
}

impl Subprocess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit, succeeding iff the exit code is zero.
    ///
    /// When the cancellation token fires first the child is killed and the
    /// result is [`BuildError::Cancelled`].
    pub async fn wait_check(&mut self, cancellable: &CancellationToken) -> Result<(), BuildError> {
        tokio::select! {
            () = cancellable.cancelled() => {
                self.child.start_kill().ok();
                let _ = self.child.wait().await;
                Err(BuildError::Cancelled)
            }
            status = self.child.wait() => {
                let status = status
                    .map_err(|err| BuildError::Io(format!("failed to wait for child: {err}")))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(BuildError::Io(format!("process exited with {status}")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::time::Duration;

    /// Returns (read, write) ends of a fresh pipe.
    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed");
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[tokio::test]
    async fn wait_check_succeeds_on_zero_exit() {
        let mut launcher = ProcessLauncher::new();
        launcher.append_args(["sh", "-c", "exit 0"]);

        let mut subprocess = launcher.spawn().unwrap();
        subprocess
            .wait_check(&CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_check_reports_nonzero_exit() {
        let mut launcher = ProcessLauncher::new();
        launcher.append_args(["sh", "-c", "exit 3"]);

        let mut subprocess = launcher.spawn().unwrap();
        let err = subprocess
            .wait_check(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Io(_)));
    }

    #[tokio::test]
    async fn wait_check_surrenders_on_cancellation() {
        let mut launcher = ProcessLauncher::new();
        launcher.append_args(["sleep", "30"]);

        let mut subprocess = launcher.spawn().unwrap();
        let cancellable = CancellationToken::new();

        let canceller = cancellable.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = subprocess.wait_check(&cancellable).await.unwrap_err();
        assert_eq!(err, BuildError::Cancelled);
    }

    #[tokio::test]
    async fn spawn_applies_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let (read, write) = pipe();

        let mut launcher = ProcessLauncher::new();
        launcher.append_args(["sh", "-c", "printf '%s %s' \"$BUILD_FLAVOR\" \"$PWD\""]);
        launcher.setenv("BUILD_FLAVOR", "release");
        launcher.set_cwd(dir.path());
        launcher.take_fd(write, 1);

        let mut subprocess = launcher.spawn().unwrap();
        subprocess
            .wait_check(&CancellationToken::new())
            .await
            .unwrap();

        let mut output = String::new();
        std::fs::File::from(read).read_to_string(&mut output).unwrap();
        assert!(output.starts_with("release "));
        assert!(output.contains(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn search_path_puts_prefixes_first_in_insertion_order() {
        let mut launcher = ProcessLauncher::new();
        launcher.setenv("PATH", "/usr/bin");
        launcher.prepend_path("/opt/toolchain/bin");
        launcher.prepend_path("/opt/sdk/bin");

        assert_eq!(
            launcher.search_path(),
            "/opt/toolchain/bin:/opt/sdk/bin:/usr/bin"
        );
    }

    #[test]
    fn spawn_without_program_is_invalid() {
        let err = ProcessLauncher::new().spawn().unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }

    #[test]
    fn spawn_rejects_non_stdio_fd_destination() {
        let (read, _write) = pipe();
        let mut launcher = ProcessLauncher::new();
        launcher.append_arg("true");
        launcher.take_fd(read, 7);

        let err = launcher.spawn().unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }
}
