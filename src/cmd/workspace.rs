//! Workspace management: `codeloop init`, `import`, `export`, `workspaces`
//! and `exec`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use codeloop::bus::{Event, EventKind};
use codeloop::runner::OutputStream;
use codeloop::workspace::{TEMPLATES, WorkspaceSnapshot, find_template};

use super::super::Cli;
use super::session::Session;

fn default_name(project_dir: &Path) -> String {
    project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace")
        .to_string()
}

fn print_created(verb: &str, snapshot: &WorkspaceSnapshot) {
    println!(
        "{} {} workspace {} ({} file(s))",
        style("✓").green(),
        verb,
        style(&snapshot.id).cyan(),
        snapshot.files.len()
    );
    match snapshot.entry_path() {
        Some(entry) => println!("  entry: {}", entry),
        None => println!("  entry: {}", style("(none)").dim()),
    }
}

pub async fn cmd_init(cli: &Cli, project_dir: &Path, template: &str, name: Option<&str>) -> Result<()> {
    if find_template(template).is_none() {
        let known: Vec<&str> = TEMPLATES.iter().map(|t| t.id).collect();
        anyhow::bail!("Unknown template '{}'. Available: {}", template, known.join(", "));
    }

    let session = Session::open(cli, project_dir)?;
    let name = name.map(str::to_string).unwrap_or_else(|| default_name(&session.config.project_dir));
    let snapshot = session.workspace.create(template, &name).await?;
    session.close().await?;
    session.select(&snapshot.id)?;

    print_created("Created", &snapshot);
    Ok(())
}

pub async fn cmd_import(cli: &Cli, project_dir: &Path, dir: &Path, name: Option<&str>) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }

    let session = Session::open(cli, project_dir)?;
    let name = name.map(str::to_string).unwrap_or_else(|| default_name(dir));
    let snapshot = session
        .workspace
        .import_dir(dir, &name)
        .await
        .with_context(|| format!("Failed to import {}", dir.display()))?;
    session.close().await?;
    session.select(&snapshot.id)?;

    print_created("Imported", &snapshot);
    Ok(())
}

pub async fn cmd_export(cli: &Cli, project_dir: &Path, dir: &Path, id: Option<&str>) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let id = match id {
        Some(id) => id.to_string(),
        None => session.selected_id(cli)?,
    };
    let written = session.workspace.export_dir(&id, dir).await?;
    println!(
        "{} Wrote {} file(s) from {} to {}",
        style("✓").green(),
        written,
        style(&id).cyan(),
        dir.display()
    );
    Ok(())
}

pub async fn cmd_workspaces(cli: &Cli, project_dir: &Path) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    let summaries = session.workspace.list().await?;
    if summaries.is_empty() {
        println!("No workspaces yet. Run 'codeloop init' to create one.");
        return Ok(());
    }

    let selected = session.selected_id(cli).ok();
    for summary in summaries {
        let marker = if selected.as_deref() == Some(summary.id.as_str()) {
            style("*").green()
        } else {
            style(" ")
        };
        println!(
            "{} {}  {:<20} {:<8} {:>3} file(s)  {}",
            marker,
            style(&summary.id).cyan(),
            summary.name,
            summary.template_id,
            summary.file_count,
            style(summary.updated_at.format("%Y-%m-%d %H:%M")).dim()
        );
    }
    Ok(())
}

pub async fn cmd_exec(cli: &Cli, project_dir: &Path, entry: Option<&str>, timeout_ms: Option<u64>) -> Result<()> {
    let mut config = codeloop::config::CodeloopConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, cli.yes)?;
    if let Some(ms) = timeout_ms {
        config.toml.runner.timeout_ms = ms;
    }
    let session = Session::from_config(config)?;
    let snapshot = session.load_selected(cli).await?;

    let entry = match entry {
        Some(entry) => entry.to_string(),
        None => snapshot
            .entry_path()
            .map(str::to_string)
            .context("Workspace has no entry file. Pass the file to run.")?,
    };

    let output = session.bus.subscribe(EventKind::RunOutput, |event| {
        if let Event::RunOutput { stream, text, .. } = event {
            match stream {
                OutputStream::Stdout => print!("{}", text),
                OutputStream::Stderr => eprint!("{}", text),
            }
        }
        Ok(())
    });

    let handle = session.runner.run(&entry)?;
    let stop = session.runner.clone();
    let run_id = handle.run_id.clone();
    let result = tokio::select! {
        result = handle.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            stop.stop(&run_id);
            anyhow::bail!("Interrupted");
        }
    };
    output.unsubscribe();

    if let Some(error) = &result.error {
        anyhow::bail!("Run failed: {}", error);
    }
    match result.exit_code {
        Some(0) | None => Ok(()),
        Some(code) => anyhow::bail!("{} exited with code {}", entry, code),
    }
}
