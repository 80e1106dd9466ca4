//! Command execution and report rendering

use colored::Colorize;
use serde::Serialize;
use tracing::info;

use crate::app::options::{AppOptions, Command};
use crate::app::state::AppState;
use crate::deploy::drift::DriftReport;
use crate::deploy::orchestrator::{
    ArtifactReport, ArtifactStatus, BatchReport, RollbackReport, ServerStatus,
};
use crate::errors::DeployerError;
use crate::models::record::{DeploymentRecord, Outcome, RollbackResult};
use crate::storage::lease::StoreLease;

/// Run one command. Returns whether it succeeded.
pub async fn run(
    app: &AppState,
    options: &AppOptions,
    command: Command,
) -> Result<bool, DeployerError> {
    let _lease = if command.mutates() && !options.dry_run {
        let lease = StoreLease::acquire(app.layout.lease_file())?;
        info!("Acquired store lease {:?}", lease.path());
        Some(lease)
    } else {
        None
    };

    let orchestrator = &app.orchestrator;
    match command {
        Command::Check => {
            let reports = orchestrator.check(&options.batch_request()).await?;
            emit(options, &reports, || print_artifacts(&reports))?;
            Ok(!reports.iter().any(|r| r.status == ArtifactStatus::Failed))
        }
        Command::Download => {
            let reports = orchestrator.download(&options.batch_request()).await?;
            emit(options, &reports, || print_artifacts(&reports))?;
            Ok(!reports.iter().any(|r| r.status == ArtifactStatus::Failed))
        }
        Command::Deploy => {
            let report = orchestrator.run_batch(&options.batch_request()).await?;
            emit(options, &report, || print_batch(&report))?;
            Ok(matches!(report.outcome, Outcome::Success | Outcome::NothingToDo))
        }
        Command::Rollback => {
            let report = orchestrator
                .rollback(&options.artifacts, &options.servers, options.dry_run)
                .await?;
            emit(options, &report, || print_rollback(&report))?;
            Ok(report.outcome != Outcome::Aborted)
        }
        Command::Audit => {
            let report = orchestrator.audit(&options.servers).await?;
            emit(options, &report, || print_drift(&report))?;
            Ok(report.is_consistent())
        }
        Command::Status => {
            let statuses = orchestrator.status(&options.servers).await?;
            emit(options, &statuses, || print_status(&statuses))?;
            Ok(true)
        }
        Command::History { limit } => {
            let records = orchestrator.history(limit).await?;
            emit(options, &records, || print_history(&records))?;
            Ok(true)
        }
    }
}

fn emit<T: Serialize>(
    options: &AppOptions,
    value: &T,
    human: impl FnOnce(),
) -> Result<(), DeployerError> {
    if options.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

fn status_label(status: ArtifactStatus) -> colored::ColoredString {
    match status {
        ArtifactStatus::Committed => "committed".green().bold(),
        ArtifactStatus::UpToDate => "up to date".green(),
        ArtifactStatus::WouldUpdate => "update available".cyan(),
        ArtifactStatus::Staged => "staged".cyan(),
        ArtifactStatus::Skipped => "skipped".yellow(),
        ArtifactStatus::Pending => "pending".normal(),
        ArtifactStatus::Failed => "failed".red().bold(),
        ArtifactStatus::Aborted => "aborted".red(),
        ArtifactStatus::RolledBack => "rolled back".red().bold(),
    }
}

fn outcome_label(outcome: Outcome) -> colored::ColoredString {
    match outcome {
        Outcome::Success => "success".green().bold(),
        Outcome::NothingToDo => "nothing to do".green(),
        Outcome::Partial => "partial".yellow().bold(),
        Outcome::Aborted => "aborted".red().bold(),
        Outcome::RolledBack => "rolled back".red().bold(),
    }
}

fn print_artifacts(reports: &[ArtifactReport]) {
    for report in reports {
        let candidate = report
            .candidate
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {} {}",
            report.artifact.bold(),
            candidate.dimmed(),
            status_label(report.status)
        );
        for (server, installed) in &report.installed {
            let installed = installed
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "not installed".to_string());
            if report.downgrades.contains(server) {
                println!("    {:<24} {} {}", server, installed, "downgrade".yellow());
            } else {
                println!("    {:<24} {}", server, installed);
            }
        }
        if let Some(reason) = &report.reason {
            println!("    {}", reason.dimmed());
        }
    }
}

fn print_batch(report: &BatchReport) {
    let title = if report.dry_run { "Dry run" } else { "Batch" };
    println!(
        "{} {}: {} ({:?})",
        title,
        report.id,
        outcome_label(report.outcome),
        report.phase
    );
    for issue in &report.preflight.issues {
        println!("  {} {}: {}", "preflight".yellow(), issue.check, issue.message);
    }
    print_artifacts(&report.artifacts);
    for warning in &report.warnings {
        println!("{} {}", "warning:".yellow(), warning.message);
    }
}

fn print_rollback(report: &RollbackReport) {
    println!(
        "Rollback {}: {}",
        report.id,
        outcome_label(report.outcome)
    );
    for pair in &report.pairs {
        let line = match (&pair.result, &pair.error) {
            (_, Some(e)) => e.red().to_string(),
            (Some(RollbackResult::Restored { version: Some(v) }), _) => {
                format!("restored {}", v).green().to_string()
            }
            (Some(RollbackResult::Restored { version: None }), _) => {
                "restored unmanaged file".green().to_string()
            }
            (Some(RollbackResult::NoBackupAvailable), _) | (None, None) => {
                "no backup available".dimmed().to_string()
            }
        };
        println!("  {} on {}: {}", pair.artifact.bold(), pair.server, line);
    }
}

fn print_drift(report: &DriftReport) {
    for platform in &report.platforms {
        println!("{} ({})", platform.platform.to_string().bold(), platform.servers.join(", "));
        for artifact in &platform.artifacts {
            let label = if artifact.is_consistent() {
                "consistent".green()
            } else if artifact.drifted {
                "drift".red().bold()
            } else {
                "missing".yellow()
            };
            println!("  {:<28} {}", artifact.artifact, label);
            if !artifact.is_consistent() {
                for (server, version) in &artifact.versions {
                    let version = version
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "not installed".to_string());
                    println!("      {:<24} {}", server, version);
                }
            }
        }
    }
}

fn print_status(statuses: &[ServerStatus]) {
    for status in statuses {
        println!("{} ({})", status.server.bold(), status.platform);
        if status.installed.is_empty() {
            println!("    {}", "nothing deployed".dimmed());
        }
        for (artifact, entry) in &status.installed {
            let backup = status
                .backups
                .iter()
                .any(|b| &b.artifact == artifact);
            println!(
                "    {:<28} {:<20} {}{}",
                artifact,
                entry.version.to_string(),
                entry.deployed_at.format("%Y-%m-%d %H:%M:%S"),
                if backup { " (backup)".dimmed().to_string() } else { String::new() }
            );
        }
    }
}

fn print_history(records: &[DeploymentRecord]) {
    for record in records {
        println!(
            "{} {} {}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.summary(),
            if record.dry_run { "(dry run)" } else { "" }
        );
        for reason in &record.reasons {
            println!("    {}", reason.dimmed());
        }
    }
}
