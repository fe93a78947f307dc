//! Existence checks for artifacts a plan declares.

use std::path::Path;

/// Filesystem existence check, behind a trait so tests can script it.
pub trait ArtifactChecker: Send + Sync {
    /// Declared paths (relative to `workdir`) that do not exist.
    fn missing(&self, workdir: &Path, declared: &[String]) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsArtifactChecker;

impl ArtifactChecker for FsArtifactChecker {
    fn missing(&self, workdir: &Path, declared: &[String]) -> Vec<String> {
        declared
            .iter()
            .filter(|rel| !workdir.join(rel.as_str()).exists())
            .cloned()
            .collect()
    }
}
