//! One migration attempt: generate, apply, verify, retry.
//!
//! An attempt owns a single file group end to end. It stages the group into
//! a scratch [`Workspace`], gates on the pre-verify command, then loops:
//! ask the model for migrated files, apply them to the staged copies, run
//! the verify command, and either promote the result or feed the failure
//! back as a corrective turn. Originals change only on a passing verify.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;

use crate::evals::capture_eval_case;
use crate::examples::{FileContent, MigrationExample};
use crate::llm::{GenerationClient, Message};
use crate::manifest::{FileGroup, MigrateResult};
use crate::parse::extract_code_blocks;
use crate::prompt;
use crate::runner::{CheckOutcome, ResolvedCommand};
use crate::selector::select_relevant_examples;
use crate::status::TaskProgress;
use crate::workspace::Workspace;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// How much failing-check output goes back into the conversation.
const FEEDBACK_TAIL_CHARS: usize = 8_000;

/// Why one generate/apply/verify round failed.
#[derive(Debug, Clone)]
pub enum RoundFailure {
    /// The response did not contain exactly the requested files.
    Protocol { detail: String },
    /// The verify command rejected the applied result. Carries the output
    /// tail that goes back into the conversation.
    Verification { output: String },
}

impl RoundFailure {
    fn feedback(&self, files: &[String]) -> Message {
        match self {
            RoundFailure::Protocol { detail } => prompt::protocol_feedback(detail, files),
            RoundFailure::Verification { output } => prompt::verification_feedback(output),
        }
    }
}

impl fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundFailure::Protocol { detail } => write!(f, "protocol violation: {detail}"),
            RoundFailure::Verification { .. } => write!(f, "verification failed"),
        }
    }
}

/// Terminal attempt failure.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The group was already failing before any generation ran.
    #[error("pre-verification failed")]
    PreVerificationFailed { output: String },
    /// Every round in the budget failed.
    #[error("no passing migration after {attempts} attempt(s); last failure: {last}")]
    AttemptsExhausted { attempts: u32, last: RoundFailure },
    /// Filesystem, network, or subprocess trouble outside the retry loop.
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl AttemptError {
    /// The manifest result this failure maps to.
    pub fn result(&self) -> MigrateResult {
        match self {
            AttemptError::PreVerificationFailed { .. } => MigrateResult::FailPreVerify,
            _ => MigrateResult::Fail,
        }
    }
}

/// Outcome of a passing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptReport {
    /// Generation rounds used, including the passing one.
    pub cycles: u32,
    /// Corrective turns appended after failed rounds.
    pub feedback_rounds: u32,
}

/// Settings shared by every attempt in a run.
#[derive(Debug)]
pub struct AttemptConfig {
    pub run_id: String,
    pub system_prompt: String,
    pub verify_cmd: ResolvedCommand,
    pub pre_verify_cmd: Option<ResolvedCommand>,
    pub examples: Vec<MigrationExample>,
    pub max_attempts: u32,
    /// Where to capture passing migrations as eval cases; `None` disables.
    pub evals_dir: Option<PathBuf>,
}

/// Line-oriented log for one attempt, written next to the run's other logs.
/// Logging failures never fail the migration.
pub struct AttemptLog {
    file: Option<fs::File>,
}

impl AttemptLog {
    pub fn create(path: &Path) -> Result<AttemptLog> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log dir {}", parent.display()))?;
        }
        let file = fs::File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        Ok(AttemptLog { file: Some(file) })
    }

    /// A log that discards everything.
    pub fn sink() -> AttemptLog {
        AttemptLog { file: None }
    }

    pub fn line(&mut self, text: &str) {
        if let Some(file) = &mut self.file {
            let _ = writeln!(file, "{text}");
        }
    }

    pub fn section(&mut self, title: &str, body: &str) {
        self.line(&format!("--- {title} ---"));
        self.line(body);
    }
}

/// Check a response against the group contract and collect its file blocks.
///
/// Every named block must be a group member and every group member must be
/// present; anonymous blocks are commentary and ignored. Returns the blocks
/// to apply, or a description of the violation.
pub fn validate_response(
    files: &[String],
    response: &str,
) -> std::result::Result<Vec<(String, String)>, String> {
    let parsed = extract_code_blocks(response);
    let named: Vec<(String, String)> = parsed
        .named_blocks()
        .map(|(name, code)| (name.to_string(), code.to_string()))
        .collect();

    if named.is_empty() {
        return Err("no named code blocks in response".to_string());
    }
    for (name, _) in &named {
        if !files.contains(name) {
            return Err(format!(
                "unexpected file '{}' (expected only: {})",
                name,
                files.join(", ")
            ));
        }
    }
    for want in files {
        if !named.iter().any(|(name, _)| name == want) {
            return Err(format!("missing file '{want}'"));
        }
    }
    Ok(named)
}

/// Driver for a single file group.
pub struct MigrationAttempt<'a, C: GenerationClient> {
    group: &'a FileGroup,
    client: &'a C,
    config: &'a AttemptConfig,
    progress: &'a TaskProgress,
    log: &'a mut AttemptLog,
}

impl<'a, C: GenerationClient> MigrationAttempt<'a, C> {
    pub fn new(
        group: &'a FileGroup,
        client: &'a C,
        config: &'a AttemptConfig,
        progress: &'a TaskProgress,
        log: &'a mut AttemptLog,
    ) -> Self {
        MigrationAttempt {
            group,
            client,
            config,
            progress,
            log,
        }
    }

    pub async fn run(mut self) -> std::result::Result<AttemptReport, AttemptError> {
        let files = &self.group.files;
        let targets = read_targets(files)?;

        self.progress.message("Preparing workspace...");
        let workspace =
            Workspace::create(&self.config.run_id, &self.group.group_name(), files)?;
        self.log
            .line(&format!("Workspace: {}", workspace.root().display()));

        if let Some(pre_verify) = &self.config.pre_verify_cmd {
            self.progress.message("Pre-verifying...");
            self.log.line(&format!("$ {pre_verify}"));
            let outcome = pre_verify.run(&workspace.staged_paths()).await?;
            self.log_outcome(&outcome);
            if !outcome.success {
                self.log.line("Pre-verification failed; skipping generation");
                return Err(AttemptError::PreVerificationFailed {
                    output: outcome.output,
                });
            }
        }

        self.progress.message("Selecting examples...");
        let selection =
            select_relevant_examples(self.client, &targets, &self.config.examples).await?;
        if !selection.selected.is_empty() {
            let names: Vec<&str> = selection
                .selected
                .iter()
                .map(|e| e.name.as_str())
                .collect();
            self.log.line(&format!("Examples: {}", names.join(", ")));
        }
        let mut transcript =
            prompt::initial_transcript(&self.config.system_prompt, &selection.selected, &targets);

        let max_attempts = self.config.max_attempts.max(1);
        let mut feedback_rounds = 0u32;
        let mut last_failure: Option<RoundFailure> = None;

        for cycle in 1..=max_attempts {
            self.progress
                .message(&format!("Attempt {cycle}: generating..."));
            let response = self.client.generate(&transcript).await?;
            transcript.push(Message::assistant(response.clone()));
            self.log.section(&format!("attempt {cycle} response"), &response);

            let failure = match validate_response(files, &response) {
                Ok(blocks) => {
                    for (name, code) in &blocks {
                        workspace.apply(name, code)?;
                    }
                    self.progress
                        .message(&format!("Attempt {cycle}: verifying..."));
                    self.log.line(&format!("$ {}", self.config.verify_cmd));
                    let outcome = self.config.verify_cmd.run(&workspace.staged_paths()).await?;
                    self.log_outcome(&outcome);
                    if outcome.success {
                        workspace.promote()?;
                        self.capture_eval(&targets);
                        self.log
                            .line(&format!("Migration attempt {cycle} status=pass"));
                        return Ok(AttemptReport {
                            cycles: cycle,
                            feedback_rounds,
                        });
                    }
                    RoundFailure::Verification {
                        output: outcome.feedback(FEEDBACK_TAIL_CHARS),
                    }
                }
                Err(detail) => RoundFailure::Protocol { detail },
            };

            self.log
                .line(&format!("Migration attempt {cycle} status=fail ({failure})"));
            if cycle < max_attempts {
                transcript.push(failure.feedback(files));
                feedback_rounds += 1;
            }
            last_failure = Some(failure);
        }

        match last_failure {
            Some(last) => Err(AttemptError::AttemptsExhausted {
                attempts: max_attempts,
                last,
            }),
            None => Err(AttemptError::Infrastructure(anyhow!(
                "attempt loop made no rounds"
            ))),
        }
    }

    fn log_outcome(&mut self, outcome: &CheckOutcome) {
        for line in outcome.output.lines() {
            self.log.line(line);
            self.progress.log(line);
        }
        let code = outcome
            .exit_code
            .map_or_else(|| "killed by signal".to_string(), |c| c.to_string());
        self.log.line(&format!("exit: {code}"));
    }

    fn capture_eval(&mut self, targets: &[FileContent]) {
        let Some(evals_dir) = &self.config.evals_dir else {
            return;
        };
        match capture_eval_case(evals_dir, self.group, targets, self.config.verify_cmd.as_str()) {
            Ok(case) => self
                .log
                .line(&format!("Eval case saved to {}", case.display())),
            Err(err) => {
                self.log
                    .line(&format!("Warning: failed to save eval case: {err:#}"));
                eprintln!("Warning: failed to save eval case: {err:#}");
            }
        }
    }
}

/// Original contents of the group's files, named as declared.
fn read_targets(files: &[String]) -> Result<Vec<FileContent>> {
    files
        .iter()
        .map(|f| {
            let content = fs::read_to_string(f)
                .with_context(|| format!("Failed to read target file {f}"))?;
            Ok(FileContent::new(f.clone(), content))
        })
        .collect()
}
