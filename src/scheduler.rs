//! Bounded-concurrency dispatch of migration attempts.
//!
//! The scheduler turns a manifest (or an explicit file list) into one task
//! per file group, runs them under a counting semaphore, and collects every
//! terminal outcome into a new manifest snapshot. One attempt failing, or
//! even panicking, never takes down its siblings: panics are caught at the
//! task boundary and recorded as plain failures.

use std::collections::HashMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::attempt::{
    AttemptConfig, AttemptError, AttemptLog, MigrationAttempt, DEFAULT_MAX_ATTEMPTS,
};
use crate::examples::load_examples;
use crate::llm::GenerationClient;
use crate::manifest::{
    find_latest_snapshot, merge_manifests, FileGroup, Manifest, ManifestEntry, MigrateResult,
};
use crate::project::{head_sha, origin_url, python, ProjectContext};
use crate::runner::CommandTemplate;
use crate::status::{ProgressSink, TaskProgress, TaskStatus};

pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Knobs for one run, after CLI and `migrate.toml` resolution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Explicit targets, each becoming its own single-file group. Empty
    /// means take the groups from the manifest.
    pub files: Vec<String>,
    pub manifest_path: Option<PathBuf>,
    /// Skip groups that are already passing.
    pub only_failed: bool,
    /// Merge the newest snapshot from the results dir before running.
    pub resume: bool,
    pub logs_dir: PathBuf,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub create_evals: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            files: Vec::new(),
            manifest_path: None,
            only_failed: false,
            resume: true,
            logs_dir: PathBuf::from("logs"),
            max_workers: DEFAULT_MAX_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            create_evals: true,
        }
    }
}

/// Run every group to a terminal state and write a results snapshot.
///
/// Returns the groups processed this run, with their final results. The
/// snapshot additionally carries manifest entries that were not processed
/// (filtered out or already passing), so the newest snapshot is always a
/// complete record for the next resume.
pub async fn run<C>(
    client: Arc<C>,
    ctx: &ProjectContext,
    options: &RunOptions,
    sink: Arc<dyn ProgressSink>,
) -> Result<Vec<FileGroup>>
where
    C: GenerationClient + 'static,
{
    let mut manifest = match &options.manifest_path {
        Some(path) => Manifest::load(path)?,
        None => Manifest::default(),
    };

    let results_dir = ctx.results_dir();
    if options.resume {
        if let Some(snapshot) = find_latest_snapshot(&results_dir)? {
            let previous = Manifest::load(&snapshot)?;
            manifest = merge_manifests(&manifest, &previous);
        }
    }

    let mut groups: Vec<FileGroup> = if options.files.is_empty() {
        manifest.files.iter().map(ManifestEntry::to_group).collect()
    } else {
        options
            .files
            .iter()
            .map(|f| FileGroup::single(f.clone()))
            .collect()
    };
    if groups.is_empty() {
        bail!(
            "No files to migrate. Provide a non-empty manifest or specify files on the command line."
        );
    }
    if options.only_failed {
        groups.retain(|g| g.result != MigrateResult::Pass);
    }

    let target_anchor = groups
        .first()
        .and_then(|g| g.files.first())
        .map(|f| anchor_dir(Path::new(f)));
    let target_repo_ref = target_anchor.as_deref().and_then(head_sha);
    let target_repo_remote = target_anchor.as_deref().and_then(origin_url);
    let migrate_repo_ref = head_sha(&ctx.dir);

    let py = python();
    let prompt_path = ctx.resolve_template(&manifest.system_prompt);
    let system_prompt = fs::read_to_string(&prompt_path)
        .with_context(|| format!("Failed to read system prompt at {prompt_path}"))?;
    let pre_verify = CommandTemplate::new(&manifest.pre_verify_cmd);
    let config = Arc::new(AttemptConfig {
        run_id: Uuid::new_v4().to_string(),
        system_prompt,
        verify_cmd: CommandTemplate::new(&manifest.verify_cmd).resolve(&ctx.dir, &py),
        pre_verify_cmd: pre_verify
            .is_configured()
            .then(|| pre_verify.resolve(&ctx.dir, &py)),
        examples: load_examples(&ctx.examples_dir())?,
        max_attempts: options.max_attempts,
        evals_dir: options.create_evals.then(|| ctx.evals_dir()),
    });

    let semaphore = Arc::new(Semaphore::new(options.max_workers.max(1)));
    let mut tasks = JoinSet::new();

    for (index, group) in groups.iter().cloned().enumerate() {
        let task_name = group.task_name();
        sink.add_task(&task_name);
        sink.set_message(&task_name, "Waiting...");

        let semaphore = semaphore.clone();
        let client = client.clone();
        let config = config.clone();
        let sink = sink.clone();
        let log_path = options.logs_dir.join(format!("{task_name}.log"));
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (index, FileGroup::new(group.files));
            };
            let progress = TaskProgress::new(sink, &task_name);
            let outcome = AssertUnwindSafe(process_one(
                &group,
                client.as_ref(),
                &config,
                &progress,
                &log_path,
            ))
            .catch_unwind()
            .await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    eprintln!("Unexpected panic in task {task_name}");
                    progress.status(TaskStatus::Failed);
                    progress.message("");
                    MigrateResult::Fail
                }
            };
            (
                index,
                FileGroup {
                    files: group.files,
                    result,
                },
            )
        });
    }

    let ticker = {
        let sink = sink.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            loop {
                interval.tick().await;
                sink.tick();
            }
        })
    };

    let mut slots: Vec<Option<FileGroup>> = vec![None; groups.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, group)) => slots[index] = Some(group),
            Err(err) => eprintln!("Migration task failed to complete: {err}"),
        }
    }
    ticker.abort();
    sink.finish();

    let results: Vec<FileGroup> = slots.into_iter().flatten().collect();

    println!("Project run complete.");
    println!("Failing files:");
    for group in &results {
        if group.result.is_fail() {
            for file in &group.files {
                println!("{file}");
            }
        }
    }
    println!("Passing files:");
    for group in &results {
        if group.result == MigrateResult::Pass {
            for file in &group.files {
                println!("{file}");
            }
        }
    }

    let mut snapshot = manifest;
    let mut entry_index: HashMap<String, usize> = snapshot
        .files
        .iter()
        .enumerate()
        .map(|(i, entry)| (entry.group_name(), i))
        .collect();
    for group in &results {
        match entry_index.get(&group.group_name()) {
            Some(&i) => snapshot.files[i].set_result(group.result),
            None => {
                entry_index.insert(group.group_name(), snapshot.files.len());
                snapshot.files.push(ManifestEntry::Group(group.clone()));
            }
        }
    }
    snapshot.target_repo_ref = target_repo_ref.unwrap_or_default();
    snapshot.target_repo_remote = target_repo_remote.unwrap_or_default();
    snapshot.migrate_repo_ref = migrate_repo_ref.unwrap_or_default();
    snapshot.time = Local::now().naive_local();
    let snapshot_path = snapshot.write_snapshot(&results_dir)?;
    println!("Results saved to {}", snapshot_path.display());

    Ok(results)
}

/// Directory to discover the target repository from.
fn anchor_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    }
}

/// Drive one group to a terminal result. Never returns an error: every
/// failure mode collapses into a manifest result plus log lines.
async fn process_one<C: GenerationClient>(
    group: &FileGroup,
    client: &C,
    config: &AttemptConfig,
    progress: &TaskProgress,
    log_path: &Path,
) -> MigrateResult {
    progress.status(TaskStatus::Running);
    progress.message("Running...");

    let mut log = match AttemptLog::create(log_path) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("Warning: {err:#}");
            AttemptLog::sink()
        }
    };

    let outcome = MigrationAttempt::new(group, client, config, progress, &mut log)
        .run()
        .await;
    let result = match outcome {
        Ok(_) => MigrateResult::Pass,
        Err(err) => {
            match &err {
                AttemptError::Infrastructure(inner) => log.line(&format!("Error: {inner:#}")),
                other => log.line(&format!("Error: {other}")),
            }
            err.result()
        }
    };

    progress.status(match result {
        MigrateResult::Pass => TaskStatus::Passed,
        _ => TaskStatus::Failed,
    });
    progress.message("");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeGenerationClient;
    use crate::status::RecordingProgress;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn project_dir(dir: &Path) -> ProjectContext {
        let project = dir.join("project");
        fs::create_dir_all(&project).unwrap();
        write(&project.join("system_prompt.md"), "You migrate code.");
        ProjectContext::resolve(Some(&project)).unwrap()
    }

    fn manifest_json(groups: &[(&Path, &str)]) -> String {
        let entries: Vec<String> = groups
            .iter()
            .map(|(path, result)| {
                format!(
                    "{{\"files\": [\"{}\"], \"result\": \"{}\"}}",
                    path.display(),
                    result
                )
            })
            .collect();
        format!(
            "{{\"files\": [{}], \"verify_cmd\": \"true\", \"pre_verify_cmd\": \"\"}}",
            entries.join(", ")
        )
    }

    fn response_for(path: &Path, content: &str) -> String {
        format!(
            "Here's the migrated code:\n### `{}`\n```\n{}\n```",
            path.display(),
            content
        )
    }

    #[tokio::test]
    async fn test_end_to_end_single_group_passes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project_dir(dir.path());
        let target = dir.path().join("a.txt");
        write(&target, "old content\n");
        let manifest_path = dir.path().join("manifest.json");
        write(&manifest_path, &manifest_json(&[(&target, "?")]));

        let response = response_for(&target, "new content");
        let client = Arc::new(FakeGenerationClient::new(vec![response.as_str()]));
        let options = RunOptions {
            manifest_path: Some(manifest_path),
            logs_dir: dir.path().join("logs"),
            create_evals: false,
            ..RunOptions::default()
        };
        let sink = Arc::new(RecordingProgress::new());

        let results = run(client.clone(), &ctx, &options, sink).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result, MigrateResult::Pass);
        assert_eq!(
            results[0].files,
            vec![target.to_string_lossy().into_owned()]
        );
        assert_eq!(fs::read_to_string(&target).unwrap(), "new content");
        assert!(dir.path().join("logs/a.txt.log").is_file());

        let snapshot = find_latest_snapshot(&ctx.results_dir()).unwrap().unwrap();
        let written = Manifest::load(&snapshot).unwrap();
        assert_eq!(written.files.len(), 1);
        assert_eq!(written.files[0].result(), MigrateResult::Pass);
    }

    #[tokio::test]
    async fn test_concurrency_stays_under_worker_bound() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project_dir(dir.path());
        let manifest_path = dir.path().join("manifest.json");

        let mut targets = Vec::new();
        let mut responses = Vec::new();
        for i in 0..4 {
            let target = dir.path().join(format!("file{i}.txt"));
            write(&target, "old\n");
            responses.push(response_for(&target, "new"));
            targets.push(target);
        }
        write(
            &manifest_path,
            &manifest_json(&targets.iter().map(|t| (t.as_path(), "?")).collect::<Vec<_>>()),
        );

        let client = Arc::new(
            FakeGenerationClient::new(responses.iter().map(String::as_str).collect())
                .with_delay(Duration::from_millis(50)),
        );
        let options = RunOptions {
            manifest_path: Some(manifest_path),
            logs_dir: dir.path().join("logs"),
            max_workers: 2,
            max_attempts: 1,
            create_evals: false,
            ..RunOptions::default()
        };
        let sink = Arc::new(RecordingProgress::new());

        let results = run(client.clone(), &ctx, &options, sink).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(client.call_count(), 4);
        assert!(client.max_concurrent_calls() <= 2);
    }

    #[tokio::test]
    async fn test_only_failed_skips_passing_groups() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project_dir(dir.path());
        let done = dir.path().join("done.txt");
        let todo = dir.path().join("todo.txt");
        write(&done, "already migrated\n");
        write(&todo, "old content\n");
        let manifest_path = dir.path().join("manifest.json");
        write(
            &manifest_path,
            &manifest_json(&[(&done, "pass"), (&todo, "?")]),
        );

        let response = response_for(&todo, "new content");
        let client = Arc::new(FakeGenerationClient::new(vec![response.as_str()]));
        let options = RunOptions {
            manifest_path: Some(manifest_path),
            only_failed: true,
            logs_dir: dir.path().join("logs"),
            create_evals: false,
            ..RunOptions::default()
        };
        let sink = Arc::new(RecordingProgress::new());

        let results = run(client.clone(), &ctx, &options, sink).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(client.call_count(), 1);
        assert_eq!(fs::read_to_string(&done).unwrap(), "already migrated\n");
        assert_eq!(fs::read_to_string(&todo).unwrap(), "new content");

        // Untouched entries survive into the snapshot.
        let snapshot = find_latest_snapshot(&ctx.results_dir()).unwrap().unwrap();
        let written = Manifest::load(&snapshot).unwrap();
        assert_eq!(written.files.len(), 2);
        assert!(written
            .files
            .iter()
            .all(|e| e.result() == MigrateResult::Pass));
    }

    #[tokio::test]
    async fn test_resume_promotes_previous_passes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project_dir(dir.path());
        let target = dir.path().join("a.txt");
        write(&target, "old content\n");
        let manifest_path = dir.path().join("manifest.json");
        write(&manifest_path, &manifest_json(&[(&target, "?")]));

        // A previous run already passed this group.
        let previous = Manifest {
            files: vec![ManifestEntry::Group(FileGroup {
                files: vec![target.to_string_lossy().into_owned()],
                result: MigrateResult::Pass,
            })],
            ..Manifest::default()
        };
        previous.write_snapshot(&ctx.results_dir()).unwrap();

        let client = Arc::new(FakeGenerationClient::new(vec![]));
        let options = RunOptions {
            manifest_path: Some(manifest_path),
            only_failed: true,
            logs_dir: dir.path().join("logs"),
            create_evals: false,
            ..RunOptions::default()
        };
        let sink = Arc::new(RecordingProgress::new());

        let results = run(client.clone(), &ctx, &options, sink).await.unwrap();

        assert!(results.is_empty());
        assert_eq!(client.call_count(), 0);
        assert_eq!(fs::read_to_string(&target).unwrap(), "old content\n");

        let snapshot = find_latest_snapshot(&ctx.results_dir()).unwrap().unwrap();
        let written = Manifest::load(&snapshot).unwrap();
        assert_eq!(written.files.len(), 1);
        assert_eq!(written.files[0].result(), MigrateResult::Pass);
    }

    #[tokio::test]
    async fn test_empty_work_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project_dir(dir.path());

        let client = Arc::new(FakeGenerationClient::new(vec![]));
        let options = RunOptions {
            resume: false,
            logs_dir: dir.path().join("logs"),
            ..RunOptions::default()
        };
        let sink = Arc::new(RecordingProgress::new());

        let err = run(client, &ctx, &options, sink).await.unwrap_err();
        assert!(err.to_string().contains("No files to migrate"));
    }

    #[tokio::test]
    async fn test_failed_group_recorded_and_originals_kept() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project_dir(dir.path());
        let target = dir.path().join("a.txt");
        write(&target, "old content\n");
        let manifest_path = dir.path().join("manifest.json");
        // verify_cmd "false" rejects every attempt.
        let manifest = format!(
            "{{\"files\": [{{\"files\": [\"{}\"], \"result\": \"?\"}}], \"verify_cmd\": \"false\", \"pre_verify_cmd\": \"\"}}",
            target.display()
        );
        write(&manifest_path, &manifest);

        let response = response_for(&target, "rejected");
        let client = Arc::new(FakeGenerationClient::new(vec![response.as_str()]));
        let options = RunOptions {
            manifest_path: Some(manifest_path),
            logs_dir: dir.path().join("logs"),
            max_attempts: 1,
            create_evals: false,
            ..RunOptions::default()
        };
        let sink = Arc::new(RecordingProgress::new());

        let results = run(client, &ctx, &options, sink).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result, MigrateResult::Fail);
        assert_eq!(fs::read_to_string(&target).unwrap(), "old content\n");

        let snapshot = find_latest_snapshot(&ctx.results_dir()).unwrap().unwrap();
        let written = Manifest::load(&snapshot).unwrap();
        assert_eq!(written.files[0].result(), MigrateResult::Fail);
    }
}
