use std::path::{Path, PathBuf};

/// File inside the workspace that feeds the payload's standard input.
pub const STDIN_FILE: &str = ".stdin";

/// Factory-level paths derived from the configured workspace directory.
pub struct FactoryPaths {
    base_dir: PathBuf,
}

impl FactoryPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base(&self) -> &Path {
        &self.base_dir
    }

    /// Workspace directory for one sandbox: `<base>/<id>/`.
    pub fn workspace(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }
}
