//! Filesystem path helpers shared by the pipeline and manifest loading.

use std::path::{Path, PathBuf};

use crate::errors::BuildError;

/// Expand shell-like notation in a path.
///
/// A leading `~` or `$HOME` is replaced with the user's home directory and a
/// relative result is anchored there. Command substitution is never
/// performed.
pub fn expand(path: &str) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));

    let expanded = if path == "~" || path == "$HOME" {
        home.clone()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else if let Some(rest) = path.strip_prefix("$HOME/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    };

    if expanded.is_absolute() {
        expanded
    } else {
        home.join(expanded)
    }
}

/// Collapse a path under the user's home directory into `~/` shorthand.
///
/// Paths outside the home directory are returned unchanged.
pub fn collapse(path: &Path) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if let Ok(rest) = path.strip_prefix(&home) {
            return PathBuf::from("~").join(rest);
        }
    }
    path.to_path_buf()
}

/// Create a directory and any missing parents with the given mode,
/// off the async runtime on a blocking thread.
pub async fn mkdir_with_parents(path: &Path, mode: u32) -> Result<(), BuildError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(&path)
    })
    .await
    .map_err(|err| BuildError::Io(format!("mkdir task failed: {err}")))?
    .map_err(BuildError::from)
}
