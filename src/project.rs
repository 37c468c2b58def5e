//! Project directory resolution, per-project settings, and scaffolding.
//!
//! A migration project is a directory holding `system_prompt.md`, `verify.py`,
//! an `examples/` library, an `evals/` capture area, and a `results/`
//! directory of manifest snapshots. The directory comes from a CLI flag, the
//! `AI_MIGRATE_PROJECT_DIR` environment variable, or the current directory.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::manifest::{SYSTEM_PROMPT_FILE, VERIFY_SCRIPT_FILE};
use crate::prompt::DEFAULT_SYSTEM_PROMPT;

pub const PROJECT_DIR_ENV: &str = "AI_MIGRATE_PROJECT_DIR";
pub const PYTHON_ENV: &str = "AI_MIGRATE_PYTHON";
const SETTINGS_FILE: &str = "migrate.toml";

/// Optional per-project overrides from `migrate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectSettings {
    pub max_workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub model: Option<String>,
    pub create_evals: Option<bool>,
}

impl ProjectSettings {
    /// Missing file means defaults; a present but invalid file is an error.
    fn load(path: &Path) -> Result<ProjectSettings> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(ProjectSettings::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub dir: PathBuf,
    pub settings: ProjectSettings,
}

impl ProjectContext {
    /// Precedence: explicit flag, then `AI_MIGRATE_PROJECT_DIR`, then `.`.
    pub fn resolve(flag: Option<&Path>) -> Result<ProjectContext> {
        let dir = match flag {
            Some(dir) => dir.to_path_buf(),
            None => match env::var(PROJECT_DIR_ENV) {
                Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
                _ => PathBuf::from("."),
            },
        };
        let settings = ProjectSettings::load(&dir.join(SETTINGS_FILE))?;
        Ok(ProjectContext { dir, settings })
    }

    pub fn examples_dir(&self) -> PathBuf {
        self.dir.join("examples")
    }

    pub fn evals_dir(&self) -> PathBuf {
        self.dir.join("evals")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.dir.join("results")
    }

    /// Substitute `{project_dir}` and `{py}` in a template string.
    pub fn resolve_template(&self, template: &str) -> String {
        template
            .replace("{project_dir}", &self.dir.to_string_lossy())
            .replace("{py}", &python())
    }
}

/// Interpreter used for `{py}` substitution.
pub fn python() -> String {
    env::var(PYTHON_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "python3".to_string())
}

/// `HEAD` commit sha of the repository containing `path`, if any.
pub fn head_sha(path: &Path) -> Option<String> {
    let repo = git2::Repository::discover(path).ok()?;
    let commit = repo.head().ok()?.peel_to_commit().ok()?;
    Some(commit.id().to_string())
}

/// URL of the `origin` remote of the repository containing `path`, if any.
pub fn origin_url(path: &Path) -> Option<String> {
    let repo = git2::Repository::discover(path).ok()?;
    let remote = repo.find_remote("origin").ok()?;
    remote.url().map(str::to_string)
}

/// Scaffold a new migration project at `path`.
pub fn init_project(path: &Path) -> Result<()> {
    if path.exists() {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("Failed to inspect {}", path.display()))?;
        if entries.next().is_some() {
            bail!(
                "Directory {} already exists and is not empty",
                path.display()
            );
        }
    }
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))?;

    for child in ["evals", "examples"] {
        let dir = path.join(child);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        println!("Created {}", dir.display());
    }

    let prompt_path = path.join(SYSTEM_PROMPT_FILE);
    fs::write(&prompt_path, DEFAULT_SYSTEM_PROMPT)
        .with_context(|| format!("Failed to write {}", prompt_path.display()))?;
    println!("Created default system prompt at {}", prompt_path.display());

    let verify_path = path.join(VERIFY_SCRIPT_FILE);
    fs::write(&verify_path, "")
        .with_context(|| format!("Failed to write {}", verify_path.display()))?;
    println!("Created empty verify script at {}", verify_path.display());

    let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    println!("To make this your default project,");
    println!("    export {PROJECT_DIR_ENV}={}", absolute.display());
    Ok(())
}
