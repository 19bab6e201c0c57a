//! Deferred removal of build artifacts.
//!
//! A [`DirectoryReaper`] collects removal requests and performs them all when
//! [`DirectoryReaper::execute`] runs. The purge driver uses it to empty the
//! build directory and then remove the directory itself. An optional minimum
//! age lets callers keep recently-touched entries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapKind {
    /// Remove the contents of a directory, leaving the directory in place.
    DirectoryContents,
    /// Remove the entry itself, file or directory.
    Entry,
}

#[derive(Debug)]
struct ReapRequest {
    path: PathBuf,
    kind: ReapKind,
    min_age: Option<Duration>,
}

/// Collects and executes filesystem removals.
#[derive(Debug, Default)]
pub struct DirectoryReaper {
    requests: Vec<ReapRequest>,
}

impl DirectoryReaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue removal of the contents of `path`. Entries younger than
    /// `min_age` are kept.
    pub fn add_directory(&mut self, path: impl Into<PathBuf>, min_age: Option<Duration>) {
        self.requests.push(ReapRequest {
            path: path.into(),
            kind: ReapKind::DirectoryContents,
            min_age,
        });
    }

    /// Queue removal of `path` itself.
    pub fn add_file(&mut self, path: impl Into<PathBuf>, min_age: Option<Duration>) {
        self.requests.push(ReapRequest {
            path: path.into(),
            kind: ReapKind::Entry,
            min_age,
        });
    }

    /// Perform every queued removal, in the order queued. Entries that no
    /// longer exist are skipped.
    pub async fn execute(&self) -> Result<(), BuildError> {
        for request in &self.requests {
            match request.kind {
                ReapKind::DirectoryContents => {
                    reap_directory_contents(&request.path, request.min_age).await?;
                }
                ReapKind::Entry => {
                    reap_entry(&request.path, request.min_age).await?;
                }
            }
        }
        Ok(())
    }
}

async fn old_enough(path: &Path, min_age: Option<Duration>) -> bool {
    let Some(min_age) = min_age else { return true };

    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => match metadata.modified().and_then(|m| {
            m.elapsed()
                .map_err(|err| std::io::Error::other(err.to_string()))
        }) {
            Ok(age) => age >= min_age,
            Err(_) => true,
        },
        Err(_) => false,
    }
}

async fn reap_directory_contents(path: &Path, min_age: Option<Duration>) -> Result<(), BuildError> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let child = entry.path();
        if !old_enough(&child, min_age).await {
            continue;
        }
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(&child).await?;
        } else {
            tokio::fs::remove_file(&child).await?;
        }
    }

    Ok(())
}

async fn reap_entry(path: &Path, min_age: Option<Duration>) -> Result<(), BuildError> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    if !old_enough(path, min_age).await {
        return Ok(());
    }

    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_removes_directory_contents_but_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("artifact.o"), b"obj").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        std::fs::write(dir.path().join("subdir/nested.o"), b"obj").unwrap();

        let mut reaper = DirectoryReaper::new();
        reaper.add_directory(dir.path(), None);
        reaper.execute().await.unwrap();

        assert!(dir.path().is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn execute_removes_the_entry_itself() {
        let dir = tempfile::tempdir().unwrap();
        let builddir = dir.path().join("_build");
        std::fs::create_dir(&builddir).unwrap();
        std::fs::write(builddir.join("stale"), b"x").unwrap();

        let mut reaper = DirectoryReaper::new();
        reaper.add_directory(&builddir, None);
        reaper.add_file(&builddir, None);
        reaper.execute().await.unwrap();

        assert!(!builddir.exists());
        assert!(dir.path().is_dir());
    }

    #[tokio::test]
    async fn execute_skips_missing_entries() {
        let dir = tempfile::tempdir().unwrap();

        let mut reaper = DirectoryReaper::new();
        reaper.add_directory(dir.path().join("never-created"), None);
        reaper.add_file(dir.path().join("never-created"), None);
        reaper.execute().await.unwrap();
    }

    #[tokio::test]
    async fn min_age_keeps_fresh_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh"), b"x").unwrap();

        let mut reaper = DirectoryReaper::new();
        reaper.add_directory(dir.path(), Some(Duration::from_secs(3600)));
        reaper.execute().await.unwrap();

        assert!(dir.path().join("fresh").exists());
    }
}
