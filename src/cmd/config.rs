//! Configuration view and validation commands: `codeloop config`.

use anyhow::Result;

use codeloop::config::{CONFIG_DIR, CONFIG_FILE, CodeloopConfig, CodeloopToml};

use super::super::ConfigCommands;

fn print_toml(file: &CodeloopToml) -> Result<()> {
    let rendered = toml::to_string_pretty(file)?;
    for line in rendered.lines() {
        println!("  {}", line);
    }
    Ok(())
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let codeloop_dir = project_dir.join(CONFIG_DIR);
    let config_path = codeloop_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Codeloop Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No codeloop.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = CodeloopConfig::new(project_dir.to_path_buf())?;
            print_toml(&config.toml)?;
            println!();

            println!("Effective values (with env overrides):");
            println!("  llm command = \"{}\"", config.llm_command());
            match config.call_options().model {
                Some(model) => println!("  model = \"{}\"", model),
                None => println!("  model = (command default)"),
            }
            println!("  max_iters = {}", config.orchestrator_settings().max_iters);
            println!("  memory path = {}", config.memory_path().display());
            println!("  workspace store = {}", config.store_dir().display());
            println!();

            if !config_path.exists() {
                println!("Run 'codeloop config init' to create a codeloop.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                CodeloopToml::load(&config_path)?
            } else {
                println!("No codeloop.toml found. Checking defaults.");
                CodeloopToml::default()
            };
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("codeloop.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !codeloop_dir.exists() {
                std::fs::create_dir_all(&codeloop_dir)?;
            }

            CodeloopToml::default().save(&config_path)?;

            println!("Created codeloop.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [llm] command, args, model");
            println!("  - [runner] timeouts, interpreters, test_patterns");
            println!("  - [orchestrator] max_iters, repeat_error_threshold, test_also");
            println!();
        }
    }

    Ok(())
}
