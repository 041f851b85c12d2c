//! Task memory commands: `codeloop memory stats|search|related|export|import`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use codeloop::config::CodeloopConfig;
use codeloop::memory::{ImportMode, MemoryFilter, Outcome, TaskMemory, TaskMemoryItem};

use super::super::{Cli, MemoryCommands};

fn print_item(item: &TaskMemoryItem, score: Option<f64>) {
    let outcome = match item.outcome {
        Outcome::Success => style(item.outcome.as_str()).green(),
        Outcome::Fail => style(item.outcome.as_str()).red(),
        Outcome::Partial | Outcome::Cancelled => style(item.outcome.as_str()).yellow(),
    };
    let score = score.map(|s| format!(" {:.2}", s)).unwrap_or_default();
    println!(
        "{} [{}] {}{}",
        style(&item.id).cyan(),
        outcome,
        item.goal,
        style(score).dim()
    );
    if !item.summary.is_empty() {
        println!("    {}", item.summary);
    }
    if !item.tags.is_empty() {
        println!("    {}", style(format!("tags: {}", item.tags.join(", "))).dim());
    }
}

pub fn cmd_memory(cli: &Cli, project_dir: &Path, command: MemoryCommands) -> Result<()> {
    let config = CodeloopConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, cli.yes)?;
    let memory = TaskMemory::open(config.memory_path(), config.toml.memory.max_items)?;

    match command {
        MemoryCommands::Stats => {
            let stats = memory.statistics();
            println!();
            println!("Task Memory");
            println!("===========");
            println!();
            println!("  items:         {}", stats.total);
            if stats.total == 0 {
                println!();
                return Ok(());
            }
            println!("  success rate:  {:.0}%", stats.success_rate * 100.0);
            println!("  avg duration:  {:.0}ms", stats.average_duration_ms);
            println!("  total tokens:  {}", stats.total_tokens);
            println!();
            println!("By outcome:");
            for (outcome, count) in &stats.by_outcome {
                println!("  {:<10} {}", outcome.as_str(), count);
            }
            println!("By category:");
            for (category, count) in &stats.by_category {
                println!("  {:<10} {}", category.as_str(), count);
            }
            if !stats.top_files.is_empty() {
                println!("Most modified files:");
                for (file, count) in &stats.top_files {
                    println!("  {:<30} {}", file, count);
                }
            }
            if !stats.top_tags.is_empty() {
                println!("Top tags:");
                for (tag, count) in &stats.top_tags {
                    println!("  {:<20} {}", tag, count);
                }
            }
            println!();
        }
        MemoryCommands::Search {
            query,
            outcome,
            tag,
            limit,
        } => {
            let outcome = outcome.as_deref().map(str::parse::<Outcome>).transpose()?;
            let hits = memory.search(&MemoryFilter {
                query,
                outcome,
                tags_any: tag,
                limit: Some(limit),
                ..Default::default()
            });
            if hits.is_empty() {
                println!("No matching tasks.");
            }
            for hit in &hits {
                print_item(&hit.item, Some(hit.score));
            }
        }
        MemoryCommands::Related { id, limit } => {
            if memory.get(&id).is_none() {
                anyhow::bail!("No remembered task with id {}", id);
            }
            let hits = memory.related(&id, limit);
            if hits.is_empty() {
                println!("No related tasks.");
            }
            for hit in &hits {
                print_item(&hit.item, Some(hit.score));
            }
        }
        MemoryCommands::Export { output } => {
            let json = memory.export()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
                    println!(
                        "{} Exported {} item(s) to {}",
                        style("✓").green(),
                        memory.len(),
                        path.display()
                    );
                }
                None => println!("{}", json),
            }
        }
        MemoryCommands::Import { file, replace } => {
            let json =
                std::fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let mode = if replace { ImportMode::Replace } else { ImportMode::Merge };
            let report = memory.import(&json, mode)?;
            println!(
                "{} Imported: {} added, {} updated, {} skipped",
                style("✓").green(),
                report.added,
                report.updated,
                report.skipped
            );
        }
    }

    Ok(())
}
