//! Per-attempt staging directories.
//!
//! Each attempt copies its file group into a private directory under the
//! system temp dir and works only on those copies. The originals are
//! touched exactly once, by [`Workspace::promote`] after a passing verify;
//! failed attempts leave no trace outside the staging directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::util::sanitize_component;

const WORKSPACE_ROOT_DIR: &str = "ai-migrate";

/// One staged file: where it came from and where its copy lives.
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// The file's name as declared in the group.
    pub name: String,
    /// Absolute path of the original.
    pub original: PathBuf,
    /// Path of the working copy inside the workspace.
    pub staged: PathBuf,
}

/// An isolated working copy of a file group.
///
/// The backing directory is removed on drop; a passing attempt promotes the
/// staged contents first.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    files: Vec<StagedFile>,
}

impl Workspace {
    /// Stage `files` under `<tmp>/ai-migrate/<run_id>/<label>`, mirroring
    /// their layout relative to the deepest directory containing them all.
    pub fn create(run_id: &str, label: &str, files: &[String]) -> Result<Workspace> {
        if files.is_empty() {
            bail!("Cannot create a workspace for an empty file group");
        }

        let originals: Vec<PathBuf> = files
            .iter()
            .map(|f| {
                Path::new(f)
                    .canonicalize()
                    .with_context(|| format!("Target file not found: {f}"))
            })
            .collect::<Result<_>>()?;

        let base = common_ancestor(&originals)
            .ok_or_else(|| anyhow!("Target files share no common parent directory"))?;

        let root = std::env::temp_dir()
            .join(WORKSPACE_ROOT_DIR)
            .join(sanitize_component(run_id))
            .join(sanitize_component(label));
        if root.exists() {
            fs::remove_dir_all(&root)
                .with_context(|| format!("Failed to clear stale workspace {}", root.display()))?;
        }
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace {}", root.display()))?;

        let mut staged_files = Vec::with_capacity(files.len());
        for (name, original) in files.iter().zip(&originals) {
            let rel = original
                .strip_prefix(&base)
                .with_context(|| format!("Failed to stage {name}"))?;
            let staged = root.join(rel);
            if let Some(parent) = staged.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to stage {name}"))?;
            }
            fs::copy(original, &staged)
                .with_context(|| format!("Failed to stage {name}"))?;
            staged_files.push(StagedFile {
                name: name.clone(),
                original: original.clone(),
                staged,
            });
        }

        Ok(Workspace {
            root,
            files: staged_files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    /// Staged paths in group order, for passing to check commands.
    pub fn staged_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.staged.clone()).collect()
    }

    /// Overwrite the staged copy of `name` with `content`.
    pub fn apply(&self, name: &str, content: &str) -> Result<()> {
        let file = self
            .files
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| anyhow!("No staged file named '{name}'"))?;
        fs::write(&file.staged, content)
            .with_context(|| format!("Failed to write staged copy of {name}"))
    }

    /// Copy every staged file back over its original.
    pub fn promote(&self) -> Result<()> {
        for file in &self.files {
            fs::copy(&file.staged, &file.original).with_context(|| {
                format!("Failed to copy {} back to {}", file.name, file.original.display())
            })?;
        }
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// Deepest directory containing every path. Single files use their parent.
fn common_ancestor(paths: &[PathBuf]) -> Option<PathBuf> {
    let first = paths.first()?;
    let mut base = first.parent()?.to_path_buf();
    loop {
        if paths.iter().all(|p| p.starts_with(&base)) {
            return Some(base);
        }
        base = base.parent()?.to_path_buf();
    }
}
