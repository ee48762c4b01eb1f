//! Tideline Migration CLI Tool
//!
//! Command-line interface over the Tideline lifecycle engine. Every
//! subcommand is turned into an argument bag and dispatched through the
//! engine's command router, so the CLI and in-process callers share one path.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tideline::migration::{
    CommandOutput, CommandRouter, LifecycleReport, MigrationError, Migrator, PlanStatus, Runner,
};
use tideline::EngineConfig;
use tideline_migrate::render::spawn_renderer;
use tideline_migrate::{
    CommandRunner, DirectoryArtifactSource, JsonFileRecordStore, UnconfiguredRunner,
};

#[derive(Parser)]
#[command(name = "tideline-migrate")]
#[command(about = "Migration lifecycle tool: apply, roll back and squash versioned migrations")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Migrations directory path (overrides config)
    #[arg(long)]
    migrations_dir: Option<PathBuf>,

    /// Applied-state file path (overrides config)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Shell command that executes each action body from stdin (overrides config)
    #[arg(long)]
    runner: Option<String>,

    /// Kill the runner after this many seconds
    #[arg(long)]
    runner_timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new migration file pair
    Generate {
        /// Migration name (e.g., "create_users_table")
        name: String,
    },

    /// Show migration status (applied vs pending)
    Status,

    /// Apply pending migrations
    #[command(alias = "promote", alias = "up")]
    Apply {
        /// Stop after this version
        #[arg(long)]
        target: Option<String>,

        /// Dry run - show the plan without running it
        #[arg(long)]
        dry_run: bool,

        /// Execute even if the safety gate blocks
        #[arg(long = "override")]
        override_safety: bool,
    },

    /// Roll back migrations
    #[command(alias = "down")]
    Rollback {
        /// Number of migrations to roll back (default from config: 1)
        #[arg(long, conflicts_with = "batch")]
        steps: Option<u64>,

        /// Batch number to roll back, or "last"
        #[arg(long)]
        batch: Option<String>,

        /// Roll back migrations applied before the grace period
        #[arg(long)]
        force: bool,

        /// Dry run - show what would be rolled back
        #[arg(long)]
        dry_run: bool,

        /// Execute even if the safety gate blocks
        #[arg(long = "override")]
        override_safety: bool,
    },

    /// Compact an applied range of migrations into one record
    Squash {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        dry_run: bool,

        #[arg(long = "override")]
        override_safety: bool,
    },

    /// Show the migration ledger, newest first
    History {
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Check applied migrations for drift, orphans and gaps
    #[command(alias = "validate")]
    Verify,

    /// List orphaned records; prune them with --force
    Clean {
        #[arg(long)]
        force: bool,

        /// Force-release a stale migration lock
        #[arg(long)]
        release_lock: bool,
    },
}

impl Commands {
    /// Router name and argument bag
    fn into_request(self) -> (&'static str, Map<String, Value>) {
        let (name, args) = match self {
            Commands::Generate { name } => ("generate", json!({ "name": name })),
            Commands::Status => ("status", json!({})),
            Commands::Apply {
                target,
                dry_run,
                override_safety,
            } => {
                let mut args = json!({ "dry_run": dry_run, "override": override_safety });
                if let Some(target) = target {
                    args["target"] = json!(target);
                }
                ("apply", args)
            }
            Commands::Rollback {
                steps,
                batch,
                force,
                dry_run,
                override_safety,
            } => {
                let mut args =
                    json!({ "force": force, "dry_run": dry_run, "override": override_safety });
                if let Some(steps) = steps {
                    args["steps"] = json!(steps);
                }
                if let Some(batch) = batch {
                    args["batch"] = match batch.parse::<u64>() {
                        Ok(n) => json!(n),
                        Err(_) => json!(batch),
                    };
                }
                ("rollback", args)
            }
            Commands::Squash {
                from,
                to,
                dry_run,
                override_safety,
            } => (
                "squash",
                json!({ "from": from, "to": to, "dry_run": dry_run, "override": override_safety }),
            ),
            Commands::History { limit } => match limit {
                Some(limit) => ("history", json!({ "limit": limit })),
                None => ("history", json!({})),
            },
            Commands::Verify => ("verify", json!({})),
            Commands::Clean {
                force,
                release_lock,
            } => ("clean", json!({ "force": force, "release_lock": release_lock })),
        };
        match args {
            Value::Object(map) => (name, map),
            _ => (name, Map::new()),
        }
    }
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    if cli.quiet {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error")).init();
    } else if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let json_output = cli.json;
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            if json_output {
                let body = match e.downcast_ref::<MigrationError>() {
                    Some(err) => serde_json::to_string_pretty(&err.envelope()),
                    None => serde_json::to_string_pretty(&json!({ "message": format!("{e:#}") })),
                };
                eprintln!("{}", body.unwrap_or_else(|_| e.to_string()));
            } else {
                eprintln!("{} {:#}", "❌ Error:".red().bold(), e);
            }
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = cli.migrations_dir {
        config.directory = dir;
    }
    if let Some(state_file) = cli.state_file {
        config.state_file = state_file;
    }
    if let Some(runner) = cli.runner {
        config.runner_command = Some(runner);
    }

    let runner: Arc<dyn Runner> = match &config.runner_command {
        Some(command) => {
            let runner = CommandRunner::new(command.clone());
            Arc::new(match cli.runner_timeout {
                Some(secs) => runner.with_timeout(Duration::from_secs(secs)),
                None => runner,
            })
        }
        None => Arc::new(UnconfiguredRunner),
    };

    let migrator = Migrator::new(
        Arc::new(DirectoryArtifactSource::new(&config.directory)),
        Arc::new(JsonFileRecordStore::new(&config.state_file)),
        runner,
    )
    .with_config(config);

    // First Ctrl-C stops the run between steps; a second one exits at once
    let cancel = migrator.cancellation();
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            process::exit(130);
        }
        log::warn!("Interrupted, stopping after the current step");
        cancel.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let renderer =
        (!cli.quiet && !cli.json).then(|| spawn_renderer(migrator.events().subscribe_all()));
    let router = CommandRouter::new(migrator);
    let (name, args) = cli.command.into_request();
    let result = router.dispatch(name, &args);

    // Dropping the router closes the event channel and lets the renderer finish
    drop(router);
    if let Some(renderer) = renderer {
        let _ = renderer.join();
    }

    let output = result?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !cli.quiet {
        print_output(&output);
    }
    Ok(exit_code(&output))
}

fn exit_code(output: &CommandOutput) -> i32 {
    match output {
        CommandOutput::Lifecycle(LifecycleReport {
            execution: Some(execution),
            ..
        }) if execution.status != PlanStatus::Completed => 2,
        CommandOutput::Verify(report) if !report.ok => 2,
        _ => 0,
    }
}

fn print_output(output: &CommandOutput) {
    match output {
        CommandOutput::Help(help) => {
            println!("{} - {}", help.name.bold(), help.description);
            for arg in help.args {
                let required = if arg.required { " (required)" } else { "" };
                println!("  --{}{}  {}", arg.name, required, arg.description);
            }
        }
        CommandOutput::Generated(report) => {
            println!("✅ Generated migration: {}", report.location);
            println!("   Edit the .up.sql and .down.sql files to implement the migration");
        }
        CommandOutput::Status(status) => {
            println!("\n📊 Migration Status\n");
            if status.applied.is_empty() {
                println!("✅ Applied Migrations: None");
            } else {
                println!("✅ Applied Migrations ({}):", status.applied_count);
                for record in &status.applied {
                    let time_str = record
                        .execution_time_ms
                        .map_or_else(|| "N/A".to_string(), |ms| format!("{ms}ms"));
                    let squash = if record.is_squash() { " [squash]" } else { "" };
                    println!(
                        "  ✓ {}_{} (batch {}, {}, {}){}",
                        record.version,
                        record.name,
                        record.batch,
                        record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                        time_str,
                        squash
                    );
                }
            }
            println!();
            if status.pending.is_empty() {
                println!("⏳ Pending Migrations: None");
            } else {
                println!("⏳ Pending Migrations ({}):", status.pending_count);
                for pending in &status.pending {
                    println!("  ⏳ {}_{} (pending)", pending.version, pending.name);
                }
            }
            for drift in &status.drift {
                println!(
                    "  {} {}_{} changed after being applied",
                    "⚠".yellow(),
                    drift.version,
                    drift.name
                );
            }
            for orphan in &status.orphans {
                println!(
                    "  {} {}_{} has no migration file",
                    "⚠".yellow(),
                    orphan.version,
                    orphan.name
                );
            }
            println!(
                "\n📈 Summary: {} applied, {} pending",
                status.applied_count, status.pending_count
            );
        }
        CommandOutput::Lifecycle(report) => print_lifecycle(report),
        CommandOutput::History(entries) => {
            if entries.is_empty() {
                println!("No history");
            }
            for entry in entries {
                println!(
                    "{}  {:<11} {}_{} (batch {})",
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action.to_string(),
                    entry.version,
                    entry.name,
                    entry.batch
                );
            }
        }
        CommandOutput::Verify(report) => {
            if report.ok {
                println!("✅ All applied migrations verified");
                return;
            }
            for drift in &report.drift {
                println!(
                    "{} {}_{}: stored {} current {}",
                    "✗".red(),
                    drift.version,
                    drift.name,
                    drift.stored,
                    drift.current
                );
            }
            for orphan in &report.orphans {
                println!("{} {}_{}: no migration file", "✗".red(), orphan.version, orphan.name);
            }
            for gap in &report.gaps {
                println!(
                    "{} {}: pending but older than the latest applied migration",
                    "✗".red(),
                    gap
                );
            }
        }
        CommandOutput::Clean(report) => {
            if let Some(holder) = &report.released_lock {
                println!("🔓 Released migration lock held by {holder}");
            }
            if report.orphans.is_empty() {
                println!("✅ No orphaned records");
            } else if report.pruned {
                println!("🧹 Pruned {} orphaned record(s)", report.orphans.len());
            } else {
                println!(
                    "Orphaned records ({}), rerun with --force to prune:",
                    report.orphans.len()
                );
                for orphan in &report.orphans {
                    println!("  {}_{}", orphan.version, orphan.name);
                }
            }
        }
    }
}

fn print_lifecycle(report: &LifecycleReport) {
    if report.is_noop() {
        println!("✅ Nothing to {}", report.operation);
        return;
    }
    if report.dry_run {
        println!("Would {} {} migration(s):", report.operation, report.plan.len());
        for (i, step) in report.plan.steps.iter().enumerate() {
            println!("  {}. {}_{}", i + 1, step.version, step.name);
        }
        return;
    }
    let Some(execution) = &report.execution else {
        return;
    };
    match execution.status {
        PlanStatus::Completed => println!(
            "✅ Successfully ran {} {} step(s)",
            execution.completed, report.operation
        ),
        PlanStatus::Aborted => println!(
            "{} Aborted after {} of {} step(s)",
            "⚠".yellow(),
            execution.completed,
            execution.total
        ),
        _ => {
            println!(
                "{} {} of {} step(s) committed",
                "❌".red(),
                execution.completed,
                execution.total
            );
            if let Some(failure) = &execution.failure {
                println!("   {}_{} failed: {}", failure.version, failure.name, failure.error);
                println!("   Fix it and rerun to resume from this step");
            }
        }
    }
}
