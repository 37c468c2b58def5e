//! External check commands (verify and pre-verify).
//!
//! A check command is configured as a whitespace-split template; the file
//! paths under test are appended as trailing arguments. Exit status is the
//! whole protocol: zero passes, anything else fails, and combined output is
//! carried back for logs and corrective prompts.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;

use crate::util::tail_chars;

/// A command template with `{project_dir}` and `{py}` placeholders, as
/// stored in manifests.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    raw: String,
}

impl CommandTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        CommandTemplate { raw: raw.into() }
    }

    /// Whether any command is configured at all.
    pub fn is_configured(&self) -> bool {
        !self.raw.trim().is_empty()
    }

    /// Substitute placeholders, yielding a runnable command.
    pub fn resolve(&self, project_dir: &Path, py: &str) -> ResolvedCommand {
        let command = self
            .raw
            .replace("{project_dir}", &project_dir.to_string_lossy())
            .replace("{py}", py);
        ResolvedCommand { command }
    }
}

/// A fully substituted check command.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    command: String,
}

impl ResolvedCommand {
    pub fn new(command: impl Into<String>) -> Self {
        ResolvedCommand {
            command: command.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.command
    }

    /// Run the command with `files` appended as arguments.
    ///
    /// Only spawn failures are errors; a non-zero exit is a normal
    /// [`CheckOutcome`].
    pub async fn run(&self, files: &[PathBuf]) -> Result<CheckOutcome> {
        let mut parts = self.command.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("Check command is empty");
        };
        let output = Command::new(program)
            .args(parts)
            .args(files)
            .output()
            .await
            .with_context(|| format!("Failed to run check command '{}'", self.command))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok(CheckOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: combined,
        })
    }
}

impl std::fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command)
    }
}

/// Result of one check command run.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Interleaved-ish stdout then stderr.
    pub output: String,
}

impl CheckOutcome {
    /// The tail of the output, sized for a corrective prompt.
    pub fn feedback(&self, max_chars: usize) -> String {
        tail_chars(&self.output, max_chars)
    }
}
