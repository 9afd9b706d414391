use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::config::Paths;
use conductor::executor::ExecOverrides;
use conductor::hygiene::HygieneConfig;
use conductor::orchestrator::{CheckpointOutcome, Orchestrator};
use conductor::state::RunStatus;
use conductor::workflow::STARTER_WORKFLOWS;
use console::style;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-phase workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip interactive confirmations
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a conductor project (starter workflows.yaml)
    Init,
    /// Start a new run
    Start {
        /// Workflow profile to run
        #[arg(long, default_value = "default")]
        profile: String,
        /// Intake YAML with project metadata
        #[arg(long)]
        intake: Option<PathBuf>,
        /// Start from a specific declared phase
        #[arg(long = "from")]
        from_phase: Option<String>,
    },
    /// Execute the current phase and advance
    Next {
        /// Force parallel execution for this invocation
        #[arg(long)]
        parallel: bool,
        /// Cap concurrent agents (never exceeds the configured maximum)
        #[arg(long)]
        max_workers: Option<usize>,
        /// Per-invocation timeout override, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Revalidate artifacts and advance (in-session mode)
    Checkpoint {
        /// Advance even over a failed validation
        #[arg(long)]
        force: bool,
    },
    /// Approve the pending consensus request
    Approve,
    /// Reject the pending consensus request
    Reject {
        #[arg(long)]
        reason: String,
    },
    /// Abort the current run, preserving artifacts and logs
    Abort,
    /// Resume an aborted or rejected run
    Resume,
    /// Admin: move the phase cursor without validation
    Jump { phase: String },
    /// Re-execute a phase without moving the cursor
    Replay { phase: String },
    /// Retry a failed phase, or one agent within it
    Retry {
        #[arg(long)]
        phase: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Non-destructive rollback of the phase cursor
    Rollback {
        #[arg(long)]
        phase: String,
    },
    /// Show run status
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },
    /// Tail the run log
    Log {
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    /// Show the metrics document for the current run
    Metrics,
    /// Run the repository hygiene scan
    Hygiene {
        /// Apply approved cleanup actions (subject to safety caps)
        #[arg(long)]
        apply: bool,
        /// Override the large-file threshold (MB)
        #[arg(long)]
        large_file_mb: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Init = cli.command {
        return cmd_init(&project_dir);
    }

    let paths = Paths::new(&project_dir)?;
    if !paths.is_initialized() {
        anyhow::bail!(
            "Project not initialized. Run 'conductor init' to create .conductor/workflows.yaml."
        );
    }
    paths.ensure_directories()?;
    let _guard = init_tracing(&paths, cli.verbose);

    let mut orch = Orchestrator::open(&project_dir)?;

    match &cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Start {
            profile,
            intake,
            from_phase,
        } => cmd_start(&mut orch, profile, intake.as_deref(), from_phase.as_deref())?,
        Commands::Next {
            parallel,
            max_workers,
            timeout,
        } => {
            let overrides = ExecOverrides {
                force_parallel: *parallel,
                max_workers: *max_workers,
                timeout_secs: *timeout,
            };
            cmd_next(&mut orch, overrides).await?;
        }
        Commands::Checkpoint { force } => cmd_checkpoint(&mut orch, *force, cli.yes)?,
        Commands::Approve => cmd_approve(&mut orch)?,
        Commands::Reject { reason } => cmd_reject(&mut orch, reason)?,
        Commands::Abort => cmd_abort(&mut orch)?,
        Commands::Resume => cmd_resume(&mut orch)?,
        Commands::Jump { phase } => cmd_jump(&mut orch, phase)?,
        Commands::Replay { phase } => {
            let outcome = orch.replay_phase(phase, ExecOverrides::default()).await?;
            println!(
                "{} Phase {} replayed (success: {})",
                style("✓").green(),
                style(phase).yellow(),
                outcome.success
            );
            if let Some(validation) = outcome.validation {
                println!("  Validation: {}", validation.status);
            }
        }
        Commands::Retry { phase, agent } => {
            let outcome = orch
                .retry(phase, agent.as_deref(), ExecOverrides::default())
                .await?;
            let what = agent
                .as_deref()
                .map(|a| format!("agent {a}"))
                .unwrap_or_else(|| format!("phase {phase}"));
            println!(
                "{} Retried {} (success: {})",
                style("✓").green(),
                what,
                outcome.success
            );
        }
        Commands::Rollback { phase } => {
            let advisory = orch.rollback_to_phase(phase)?;
            println!("{} Rolled back to phase {}", style("✓").green(), style(phase).yellow());
            println!("  Advisory: {}", advisory.display());
            println!("  No artifacts were deleted.");
        }
        Commands::Status { json } => cmd_status(&orch, *json)?,
        Commands::Log { lines } => {
            for line in orch.log_tail(*lines)? {
                println!("{line}");
            }
        }
        Commands::Metrics => cmd_metrics(&orch)?,
        Commands::Hygiene {
            apply,
            large_file_mb,
        } => cmd_hygiene(&orch, *apply, *large_file_mb)?,
    }

    Ok(())
}

fn init_tracing(paths: &Paths, verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "conductor=debug" } else { "conductor=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let appender = tracing_appender::rolling::never(&paths.log_dir, "conductor.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    let conductor_dir = project_dir.join(".conductor");
    let workflows = conductor_dir.join("workflows.yaml");
    if workflows.exists() {
        println!("{} Project already initialized", style("✓").green());
        return Ok(());
    }
    std::fs::create_dir_all(&conductor_dir)?;
    std::fs::write(&workflows, STARTER_WORKFLOWS)?;
    println!("{} Initialized conductor project", style("✓").green());
    println!("  Edit {} to declare your phases and agents", workflows.display());
    Ok(())
}

fn cmd_start(
    orch: &mut Orchestrator,
    profile: &str,
    intake: Option<&std::path::Path>,
    from_phase: Option<&str>,
) -> Result<()> {
    let status = orch.status();
    if !status.can_start() {
        println!(
            "{} Run already active (status: {})",
            style("⚠").yellow(),
            status
        );
        println!("  Use {} to stop it first", style("conductor abort").cyan());
        return Ok(());
    }

    let state = orch.start_run(profile, intake, from_phase)?;
    println!("{} Run initialized: {}", style("✓").green(), style(&state.run_id).cyan());
    println!(
        "  Current phase: {}",
        style(state.current_phase.as_deref().unwrap_or("-")).yellow()
    );
    if let Some(name) = &state.metadata.project_name {
        println!("  Project: {name}");
    }
    println!();
    println!("Run {} to execute the current phase", style("conductor next").cyan());
    Ok(())
}

async fn cmd_next(orch: &mut Orchestrator, overrides: ExecOverrides) -> Result<()> {
    if orch.status() == RunStatus::Idle {
        println!("{} No active run", style("⚠").yellow());
        println!("Start one with {}", style("conductor start").cyan());
        return Ok(());
    }

    // Ctrl-C aborts the run, cancelling in-flight agents.
    let cancel = orch.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = orch.next_phase(overrides).await?;
    println!(
        "{} Phase {} executed",
        style("✓").green(),
        style(&outcome.phase_name).yellow()
    );

    for agent in &outcome.agent_outcomes {
        let marker = if agent.is_in_session() {
            style("⏸").yellow()
        } else if agent.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        let retries = if agent.retry_count > 0 {
            format!(" ({} retries)", agent.retry_count)
        } else {
            String::new()
        };
        println!("  {marker} {}{retries}", agent.agent_name);
        if !agent.notes.is_empty() {
            let excerpt: String = agent.notes.chars().take(100).collect();
            println!("     {}", style(excerpt).dim());
        }
    }

    if outcome.in_session {
        println!();
        println!("{}", style("⏸ IN-SESSION MODE").yellow().bold());
        println!("  Instructions: .conductor/in-session/INSTRUCTIONS.md");
        println!(
            "  Do the work, then run {} to validate and advance",
            style("conductor checkpoint").cyan()
        );
        return Ok(());
    }

    if let Some(ref validation) = outcome.validation {
        println!(
            "  Validation: {} ({} found, {} missing)",
            validation.status,
            validation.found.len(),
            validation.missing.len()
        );
    }

    if outcome.awaiting_consensus {
        println!();
        println!("{}", style("⏸ Consensus required").yellow().bold());
        println!("  Review: .conductor/consensus/REQUEST.md");
        println!(
            "  Then {} or {}",
            style("conductor approve").green(),
            style("conductor reject --reason \"...\"").red()
        );
    } else if orch.status() == RunStatus::Completed {
        println!();
        println!("{}", style("Run completed").green().bold());
    } else if !outcome.success {
        println!();
        println!(
            "{} Phase did not succeed; fix and re-run {}, or force past it with {}",
            style("⚠").yellow(),
            style("conductor next").cyan(),
            style("conductor checkpoint --force").cyan()
        );
    } else if let Some(state) = orch.state() {
        println!(
            "  Next phase: {}",
            style(state.current_phase.as_deref().unwrap_or("-")).yellow()
        );
    }
    Ok(())
}

fn cmd_checkpoint(orch: &mut Orchestrator, force: bool, assume_yes: bool) -> Result<()> {
    let outcome = orch.checkpoint(force, assume_yes)?;
    match outcome {
        CheckpointOutcome::Advanced {
            report,
            run_completed,
            next_phase,
        } => {
            if let Some(report) = report {
                println!("  Validation: {}", report.status);
            }
            if run_completed {
                println!("{}", style("Run completed").green().bold());
            } else {
                println!(
                    "{} Advanced to phase {}",
                    style("✓").green(),
                    style(next_phase.as_deref().unwrap_or("-")).yellow()
                );
            }
        }
        CheckpointOutcome::Blocked { report } => {
            println!("{}", style("✗ Checkpoint validation failed").red().bold());
            for missing in &report.missing {
                println!("  missing: {}", style(missing).red());
            }
            println!(
                "Complete the artifacts, or advance anyway with {}",
                style("conductor checkpoint --force").cyan()
            );
        }
        CheckpointOutcome::NeedsConfirmation { report } => {
            println!("{}", style("⚠ Partial validation").yellow().bold());
            for missing in &report.missing {
                println!("  missing: {}", style(missing).yellow());
            }
            let proceed = dialoguer::Confirm::new()
                .with_prompt("Proceed to the next phase anyway?")
                .default(false)
                .interact()?;
            if proceed {
                return cmd_checkpoint(orch, false, true);
            }
            println!("{}", style("Checkpoint cancelled").yellow());
        }
    }
    Ok(())
}

fn cmd_approve(orch: &mut Orchestrator) -> Result<()> {
    let phase = orch
        .state()
        .and_then(|s| s.consensus_phase.clone())
        .unwrap_or_default();
    orch.approve_consensus()?;
    println!("{} Consensus approved for {}", style("✓").green(), style(&phase).yellow());
    if orch.status() == RunStatus::Completed {
        println!("{}", style("Run completed").green().bold());
    } else if let Some(state) = orch.state() {
        println!(
            "  Next phase: {}",
            style(state.current_phase.as_deref().unwrap_or("-")).yellow()
        );
    }
    Ok(())
}

fn cmd_reject(orch: &mut Orchestrator, reason: &str) -> Result<()> {
    let phase = orch
        .state()
        .and_then(|s| s.consensus_phase.clone())
        .unwrap_or_default();
    orch.reject_consensus(reason)?;
    println!("{} Consensus rejected for {}", style("✗").red(), style(&phase).yellow());
    println!("  Reason: {reason}");
    println!(
        "  After revisions, run {} to continue",
        style("conductor resume").cyan()
    );
    Ok(())
}

fn cmd_abort(orch: &mut Orchestrator) -> Result<()> {
    orch.abort_run()?;
    println!("{} Run aborted; artifacts and logs preserved", style("✓").red());
    println!("  Resume later with {}", style("conductor resume").cyan());
    Ok(())
}

fn cmd_resume(orch: &mut Orchestrator) -> Result<()> {
    orch.resume_run()?;
    let phase = orch
        .state()
        .and_then(|s| s.current_phase.clone())
        .unwrap_or_default();
    println!("{} Run resumed at phase {}", style("✓").green(), style(&phase).yellow());
    Ok(())
}

fn cmd_jump(orch: &mut Orchestrator, phase: &str) -> Result<()> {
    println!("{}", style("⚠ ADMIN: unchecked phase jump").red().bold());
    orch.jump_to_phase(phase)?;
    println!("{} Cursor set to {}", style("✓").green(), style(phase).yellow());
    Ok(())
}

fn cmd_status(orch: &Orchestrator, json: bool) -> Result<()> {
    let snapshot = orch.status_snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let marker = match snapshot.status {
        RunStatus::Idle => style("⚪").dim(),
        RunStatus::Running => style("🟢").green(),
        RunStatus::AwaitingConsensus => style("⏸").yellow(),
        RunStatus::NeedsRevision => style("⚠").yellow(),
        RunStatus::Aborted => style("🔴").red(),
        RunStatus::Completed => style("✅").green(),
    };
    println!("Status: {marker} {}", style(snapshot.status).bold());
    if let Some(run_id) = &snapshot.run_id {
        println!("Run: {}", style(run_id).cyan());
    }
    if let Some(phase) = &snapshot.current_phase {
        println!("Current phase: {}", style(phase).yellow());
    }
    if !snapshot.completed_phases.is_empty() {
        println!("Completed:");
        for phase in &snapshot.completed_phases {
            println!("  ✓ {phase}");
        }
    }
    if snapshot.awaiting_consensus {
        println!(
            "{} awaiting consensus on {}",
            style("⏸").yellow(),
            snapshot.consensus_phase.as_deref().unwrap_or("-")
        );
    }
    if !snapshot.checkpoints.is_empty() {
        println!("Checkpoints:");
        for (phase, verdict) in &snapshot.checkpoints {
            println!("  {phase}: {verdict}");
        }
    }
    if let (Some(score), Some(grade)) = (snapshot.cleanliness_score, &snapshot.cleanliness_grade) {
        println!("Cleanliness: {score}/100 (Grade: {grade})");
    }
    Ok(())
}

fn cmd_metrics(orch: &Orchestrator) -> Result<()> {
    match orch.metrics_document()? {
        None => println!("{} No active run", style("⚠").yellow()),
        Some(metrics) => {
            println!("Metrics for run {}", style(&metrics.run_id).cyan());
            for (phase, data) in &metrics.phases {
                let marker = if data.success { style("✓").green() } else { style("✗").red() };
                println!("  {marker} {phase}: {:.2}s", data.duration_s);
                for agent in &data.agents {
                    println!(
                        "      {} {:.2}s, {} retries, exit {}",
                        agent.agent_name, agent.duration_s, agent.retry_count, agent.exit_code
                    );
                }
            }
            if let Some(ref snapshot) = metrics.cleanliness {
                println!("  Cleanliness: {}/100 ({})", snapshot.score, snapshot.grade);
            }
        }
    }
    Ok(())
}

fn cmd_hygiene(orch: &Orchestrator, apply: bool, large_file_mb: Option<f64>) -> Result<()> {
    if apply && orch.status() == RunStatus::Running {
        println!(
            "{} A workflow run is active; finish or abort it before applying cleanup",
            style("⚠").yellow()
        );
        return Ok(());
    }

    let mut config = HygieneConfig::load_or_default(&orch.paths.hygiene_file)?;
    if let Some(mb) = large_file_mb {
        config.large_file_mb = mb;
    }

    println!("{}", style("Repository Hygiene Scan").bold());
    let report = orch.run_hygiene(&config, apply)?;

    println!(
        "Cleanliness: {}/100 (Grade: {})",
        style(report.score.score).bold(),
        report.score.grade
    );
    println!("  - {} orphaned files", report.orphans);
    println!(
        "  - {} large binaries ({} whitelisted)",
        report.large_files, report.whitelisted_large_files
    );
    println!(
        "  - {} unused functions, {} unused types, {} unused imports",
        report.dead_functions, report.dead_types, report.dead_imports
    );
    println!("  - {} notebooks need output clearing", report.notebooks_needing_cleanup);
    println!("  - {} secret findings", report.secret_findings);
    println!();
    println!("Reports written under reports/");

    if report.apply_blocked {
        println!();
        println!("{}", style("APPLY BLOCKED - safety thresholds exceeded").red().bold());
        println!("  See reports/PR_PLAN.md; split the cleanup into smaller batches.");
    } else if apply {
        println!();
        println!(
            "{} Cleanup applied: {} file(s) removed, {} notebook(s) cleared",
            style("✓").green(),
            report.files_removed.len(),
            report.notebooks_cleared
        );
    } else {
        println!();
        println!("{} Dry-run: no changes applied", style("⚠").yellow());
        println!("  Review reports/PR_PLAN.md, then run {}", style("conductor hygiene --apply").cyan());
    }

    if !report.passes_gate(&config) {
        println!();
        println!(
            "{} Cleanliness score below the configured minimum ({})",
            style("✗").red(),
            config.quality.min_cleanliness_score
        );
    }
    Ok(())
}
