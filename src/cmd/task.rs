//! Agent tasks: `codeloop plan`, `edit` and `fix`, plus the approval gate.

use anyhow::Result;
use console::style;
use dialoguer::Confirm;
use std::path::Path;

use codeloop::orchestrator::{FixOptions, StopReason, Task, TaskStatus};

use super::super::Cli;
use super::progress::TaskProgress;
use super::session::Session;

pub async fn cmd_plan(cli: &Cli, project_dir: &Path, goal: &str) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    session.load_selected(cli).await?;

    let progress = TaskProgress::start(&session.bus, "plan", cli.verbose);
    progress.set_message("asking planner");
    let plan = session.orchestrator.plan_focus(goal).await;
    progress.finish("done");
    let plan = plan?;

    println!();
    println!("{}", style("Focus files").bold());
    for path in &plan.focus_paths {
        println!("  {}", style(path).cyan());
    }
    if plan.fallback {
        println!(
            "  {}",
            style("(planner reply unusable, fell back to the entry file)").yellow()
        );
    }
    if !plan.notes.is_empty() {
        println!();
        println!("{}", plan.notes);
    }
    if cli.verbose {
        println!();
        println!("{}", style(format!("tokens: {}", plan.tokens)).dim());
    }
    Ok(())
}

/// Focus given on the command line, or the planner's choice when empty.
async fn resolve_focus(session: &Session, cli: &Cli, goal: &str, focus: &[String]) -> Result<Vec<String>> {
    if !focus.is_empty() {
        return Ok(focus.to_vec());
    }
    let progress = TaskProgress::start(&session.bus, "plan", cli.verbose);
    progress.set_message("asking planner");
    let plan = session.orchestrator.plan_focus(goal).await;
    progress.finish("focus chosen");
    let plan = plan?;
    println!(
        "{} Focus: {}",
        style("→").dim(),
        plan.focus_paths.join(", ")
    );
    Ok(plan.focus_paths)
}

pub async fn cmd_edit(cli: &Cli, project_dir: &Path, goal: &str, focus: &[String]) -> Result<()> {
    let session = Session::open(cli, project_dir)?;
    session.load_selected(cli).await?;
    let focus = resolve_focus(&session, cli, goal, focus).await?;

    let progress = TaskProgress::start(&session.bus, "edit", cli.verbose);
    let task = session.orchestrator.run_edit_task(goal, &focus).await;
    progress.finish("finished");
    let task = task?;

    print_task(&task);
    approval_gate(&session, cli, &task)?;
    session.close().await
}

pub async fn cmd_fix(
    cli: &Cli,
    project_dir: &Path,
    goal: &str,
    focus: &[String],
    max_iters: Option<u32>,
    test_also: bool,
) -> Result<()> {
    let mut config = codeloop::config::CodeloopConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, cli.yes)?;
    config.cli_model = cli.model.clone();
    config.cli_max_iters = max_iters;
    config.cli_test_also = test_also;
    let session = Session::from_config(config)?;
    session.load_selected(cli).await?;
    let focus = resolve_focus(&session, cli, goal, focus).await?;

    let options = FixOptions::from(session.orchestrator.settings());
    let progress = TaskProgress::start(&session.bus, "fix", cli.verbose);
    progress.set_message(format!("baseline run (up to {} iteration(s))", options.max_iters));
    let task = session.orchestrator.run_auto_fix(goal, &focus, options).await;
    progress.finish("finished");
    let task = task?;

    print_task(&task);
    approval_gate(&session, cli, &task)?;
    session.close().await
}

fn print_task(task: &Task) {
    println!();
    println!(
        "{} {} {}",
        style("Task").bold(),
        style(&task.id).cyan(),
        style(format!("[{}]", task.status)).dim()
    );

    if let Some(baseline) = &task.baseline {
        match baseline.headline() {
            Some(headline) => println!("  baseline: {}", style(headline).red()),
            None => println!("  baseline: {}", style("clean").green()),
        }
    }
    for iteration in &task.iterations {
        let result = match iteration.run.headline() {
            Some(headline) => style(headline).red(),
            None => style("clean".to_string()).green(),
        };
        println!(
            "  iteration {}: {} changed, {}",
            iteration.i,
            iteration.changed.len(),
            result
        );
    }
    if let Some(reason) = &task.stop_reason {
        println!("  stopped: {}", describe_stop(reason));
    }

    if let Some(error) = &task.error {
        println!("  {} {}", style("error:").red().bold(), error);
    }
    if !task.notes.is_empty() {
        println!();
        println!("{}", task.notes);
    }
    if !task.review_notes.is_empty() {
        println!();
        println!("{} {}", style("Review:").bold(), task.review_notes);
    }

    if !task.proposed.is_empty() {
        println!();
        println!("{}", style("Proposed changes").bold());
        for change in &task.proposed {
            let (added, removed) = change.line_delta();
            let kind = if change.is_new_file() {
                style("new").green()
            } else {
                style("mod").yellow()
            };
            println!(
                "  {} {}  {} {}",
                kind,
                change.path,
                style(format!("+{}", added)).green(),
                style(format!("-{}", removed)).red()
            );
        }
    }
    println!(
        "{}",
        style(format!("tokens: {}  duration: {}ms", task.tokens_used, task.duration_ms())).dim()
    );
}

fn describe_stop(reason: &StopReason) -> String {
    match reason {
        StopReason::Clean => "program runs cleanly".to_string(),
        StopReason::NothingToDo => "nothing to change".to_string(),
        StopReason::NoEdits => "coder proposed no edits".to_string(),
        StopReason::RepeatedError { signature } => format!("same error repeated: {}", signature),
        StopReason::MaxIterations => "iteration budget used up".to_string(),
    }
}

/// Ask before writing staged changes into the workspace. `--yes` applies
/// without asking; a prompt that cannot be shown counts as a refusal.
fn approval_gate(session: &Session, cli: &Cli, task: &Task) -> Result<()> {
    match task.status {
        TaskStatus::PendingApproval => {}
        TaskStatus::Error => {
            session.orchestrator.reject_changes(&task.id)?;
            anyhow::bail!("Task {} failed", task.id);
        }
        _ => return Ok(()),
    }

    if task.proposed.is_empty() {
        session.orchestrator.reject_changes(&task.id)?;
        println!("Nothing to apply.");
        return Ok(());
    }

    let apply = if cli.yes {
        println!(
            "  {} applying {} change(s) (--yes flag)",
            style("⚠").yellow(),
            task.proposed.len()
        );
        true
    } else {
        Confirm::new()
            .with_prompt(format!("Apply {} change(s) to the workspace?", task.proposed.len()))
            .default(false)
            .interact()
            .unwrap_or(false)
    };

    if apply {
        session.orchestrator.apply_changes(&task.id, None)?;
        println!("{} Applied {} change(s)", style("✓").green(), task.proposed.len());
    } else {
        session.orchestrator.reject_changes(&task.id)?;
        println!("Changes discarded");
    }
    Ok(())
}
