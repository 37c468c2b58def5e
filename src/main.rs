use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::tty::IsTty;
use uuid::Uuid;

use ai_migrate::attempt::DEFAULT_MAX_ATTEMPTS;
use ai_migrate::config::Config;
use ai_migrate::llm::OpenRouterClient;
use ai_migrate::manifest::{find_latest_snapshot, FileGroup, Manifest, ManifestEntry, MigrateResult};
use ai_migrate::project::{init_project, python, ProjectContext};
use ai_migrate::runner::CommandTemplate;
use ai_migrate::scheduler::{self, RunOptions, DEFAULT_MAX_WORKERS};
use ai_migrate::status::{PlainProgress, ProgressSink, TermProgress};

#[derive(Parser, Debug)]
#[command(
    name = "ai-migrate",
    about = "Migrate code with LLM generations gated by external verification",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate files from a manifest or the command line
    Run(RunArgs),
    /// Scaffold a new migration project
    Init {
        /// Directory to create the project in
        path: PathBuf,
    },
    /// Run the project's verify command against files
    Verify(CheckArgs),
    /// Run the project's pre-verify command against files
    PreVerify(CheckArgs),
    /// Summarize the newest results snapshot
    Status {
        /// Project directory (default: $AI_MIGRATE_PROJECT_DIR, then .)
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
    /// Print a manifest of N randomly sampled entries with a given result
    Sample(SampleArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Files to migrate, each as its own group (defaults to manifest groups)
    files: Vec<String>,

    /// Manifest file with groups and command templates
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Project directory (default: $AI_MIGRATE_PROJECT_DIR, then .)
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Directory for per-group migration logs
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    /// Concurrent migrations
    #[arg(long)]
    max_workers: Option<usize>,

    /// Generate/verify cycles per group before giving up
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Skip groups that already pass
    #[arg(long)]
    only_failed: bool,

    /// Do not merge the newest results snapshot before running
    #[arg(long)]
    no_resume: bool,

    /// Do not capture eval cases for passing migrations
    #[arg(long)]
    no_evals: bool,

    /// Line-by-line status output instead of the live display
    #[arg(long)]
    plain: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Files to check
    #[arg(required = true)]
    files: Vec<String>,

    /// Manifest supplying the command template
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Project directory (default: $AI_MIGRATE_PROJECT_DIR, then .)
    #[arg(long)]
    project_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SampleArgs {
    /// Manifest to sample from
    manifest_file: PathBuf,

    /// Result filter: "?", "pass", "fail", or "fail-pre-verify"
    result: String,

    /// Number of entries to sample
    n: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Run(args) => cmd_run(args).await,
        Command::Init { path } => init_project(&path),
        Command::Verify(args) => cmd_check(args, false).await,
        Command::PreVerify(args) => cmd_check(args, true).await,
        Command::Status { project_dir } => cmd_status(project_dir),
        Command::Sample(args) => cmd_sample(args),
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let ctx = ProjectContext::resolve(args.project_dir.as_deref())?;
    let mut config = Config::load();
    if let Some(model) = &ctx.settings.model {
        config.model = model.clone();
    }
    let client = Arc::new(OpenRouterClient::from_config(&config)?);

    let sink: Arc<dyn ProgressSink> = if args.plain || !io::stderr().is_tty() {
        Arc::new(PlainProgress)
    } else {
        Arc::new(TermProgress::new())
    };

    let options = RunOptions {
        files: args.files,
        manifest_path: args.manifest,
        only_failed: args.only_failed,
        resume: !args.no_resume,
        logs_dir: args.logs_dir,
        max_workers: args
            .max_workers
            .or(ctx.settings.max_workers)
            .unwrap_or(DEFAULT_MAX_WORKERS),
        max_attempts: args
            .max_attempts
            .or(ctx.settings.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        create_evals: !args.no_evals && ctx.settings.create_evals.unwrap_or(true),
    };

    let results = scheduler::run(client, &ctx, &options, sink).await?;
    if results.iter().any(|group| group.result.is_fail()) {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_check(args: CheckArgs, pre: bool) -> Result<()> {
    let ctx = ProjectContext::resolve(args.project_dir.as_deref())?;
    let manifest = match &args.manifest {
        Some(path) => Manifest::load(path)?,
        None => Manifest::default(),
    };
    let template = CommandTemplate::new(if pre {
        &manifest.pre_verify_cmd
    } else {
        &manifest.verify_cmd
    });
    if !template.is_configured() {
        bail!(
            "No {} command configured",
            if pre { "pre-verify" } else { "verify" }
        );
    }

    let command = template.resolve(&ctx.dir, &python());
    let files: Vec<PathBuf> = args.files.iter().map(PathBuf::from).collect();
    let outcome = command.run(&files).await?;
    print!("{}", outcome.output);
    if !outcome.success {
        std::process::exit(outcome.exit_code.unwrap_or(1));
    }
    Ok(())
}

fn cmd_status(project_dir: Option<PathBuf>) -> Result<()> {
    let ctx = ProjectContext::resolve(project_dir.as_deref())?;
    let results_dir = ctx.results_dir();
    let Some(snapshot) = find_latest_snapshot(&results_dir)? else {
        println!("No results snapshots found in {}.", results_dir.display());
        return Ok(());
    };
    let manifest = Manifest::load(&snapshot)?;

    let mut passing = Vec::new();
    let mut failing = Vec::new();
    let mut pending = Vec::new();
    for entry in &manifest.files {
        let group = entry.to_group();
        match entry.result() {
            MigrateResult::Pass => passing.push(group),
            result if result.is_fail() => failing.push(group),
            _ => pending.push(group),
        }
    }

    println!("Snapshot: {}", snapshot.display());
    if failing.is_empty() && pending.is_empty() {
        println!("All files passing! Ready to merge.");
    } else {
        print_group_list(&passing, "passing");
        print_group_list(&failing, "failing");
        print_group_list(&pending, "not yet attempted");
    }
    Ok(())
}

fn print_group_list(groups: &[FileGroup], label: &str) {
    if groups.is_empty() {
        return;
    }
    println!("{} files {}:", groups.len(), label);
    for group in groups {
        for file in &group.files {
            println!("  {file}");
        }
    }
}

fn cmd_sample(args: SampleArgs) -> Result<()> {
    let mut manifest = Manifest::load(&args.manifest_file)?;
    let result: MigrateResult = args.result.parse()?;

    let mut matching: Vec<ManifestEntry> = manifest
        .files
        .iter()
        .filter(|entry| entry.result() == result)
        .cloned()
        .collect();
    if matching.len() < args.n {
        bail!(
            "Only {} entries have result {}; cannot sample {}",
            matching.len(),
            result,
            args.n
        );
    }
    matching.sort_by_cached_key(|_| Uuid::new_v4());
    matching.truncate(args.n);

    manifest.files = matching;
    println!("{}", manifest.to_json_pretty()?);
    Ok(())
}
