//! Wiring shared by every command that touches a workspace.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use codeloop::bus::EventBus;
use codeloop::config::CodeloopConfig;
use codeloop::llm::CommandLlmClient;
use codeloop::memory::TaskMemory;
use codeloop::orchestrator::Orchestrator;
use codeloop::runner::{ProcessBackend, SandboxRunner};
use codeloop::workspace::{FsStore, WorkspaceModel, WorkspaceSnapshot};

use super::super::Cli;

/// Every subsystem built from one resolved configuration.
pub struct Session {
    pub config: CodeloopConfig,
    pub bus: EventBus,
    pub workspace: WorkspaceModel,
    pub runner: SandboxRunner,
    pub orchestrator: Orchestrator,
}

impl Session {
    pub fn open(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let mut config = CodeloopConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, cli.yes)?;
        config.cli_model = cli.model.clone();
        Self::from_config(config)
    }

    pub fn from_config(config: CodeloopConfig) -> Result<Self> {
        for warning in config.validate() {
            tracing::warn!(%warning, "configuration warning");
        }

        let bus = EventBus::new(config.history_capacity());
        let store = Arc::new(FsStore::new(config.store_dir()));
        let workspace = WorkspaceModel::new(store, bus.clone(), config.debounce());
        let memory = TaskMemory::open(config.memory_path(), config.toml.memory.max_items)?.with_bus(bus.clone());
        let backend = Arc::new(ProcessBackend::new(config.interpreters()));
        let runner = SandboxRunner::new(backend, workspace.clone(), bus.clone(), config.runner_settings());
        let llm = Arc::new(CommandLlmClient::new(
            config.llm_command(),
            config.toml.llm.args.clone(),
            config.llm_timeout(),
        ));
        let orchestrator = Orchestrator::new(
            workspace.clone(),
            runner.clone(),
            memory,
            llm,
            bus.clone(),
            config.orchestrator_settings(),
        );

        Ok(Self {
            config,
            bus,
            workspace,
            runner,
            orchestrator,
        })
    }

    /// Id of the workspace to operate on: the `--workspace` flag, else the
    /// one recorded by the last `init` or `import`.
    pub fn selected_id(&self, cli: &Cli) -> Result<String> {
        if let Some(id) = &cli.workspace {
            return Ok(id.clone());
        }
        let marker = self.config.current_file();
        let id = std::fs::read_to_string(&marker)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        id.with_context(|| "No workspace selected. Run 'codeloop init' or 'codeloop import <dir>' first.")
    }

    /// Load the selected workspace and make it current.
    pub async fn load_selected(&self, cli: &Cli) -> Result<WorkspaceSnapshot> {
        let id = self.selected_id(cli)?;
        let snapshot = self
            .workspace
            .load(&id)
            .await
            .with_context(|| format!("Failed to load workspace {}", id))?;
        Ok(snapshot)
    }

    /// Remember `id` as the workspace later commands operate on.
    pub fn select(&self, id: &str) -> Result<()> {
        std::fs::create_dir_all(&self.config.codeloop_dir)
            .with_context(|| format!("Failed to create {}", self.config.codeloop_dir.display()))?;
        let marker = self.config.current_file();
        std::fs::write(&marker, id).with_context(|| format!("Failed to write {}", marker.display()))?;
        Ok(())
    }

    /// Wait for pending workspace writes before the process exits.
    pub async fn close(&self) -> Result<()> {
        self.workspace.flush().await.context("Failed to save workspace")?;
        Ok(())
    }
}
