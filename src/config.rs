//! Layered configuration for codeloop.
//!
//! Settings come from `.codeloop/codeloop.toml`, then environment variables,
//! then CLI flags, later layers winning.
//!
//! ```toml
//! [llm]
//! command = "claude"
//! args = ["--print"]
//! model = "sonnet"
//!
//! [runner]
//! timeout_ms = 5000
//! fix_timeout_ms = 2500
//! test_patterns = ["*.test.js", "test_*.py"]
//!
//! [runner.interpreters]
//! javascript = ["node", "-"]
//! python = ["python3", "-"]
//!
//! [orchestrator]
//! max_iters = 4
//! repeat_error_threshold = 1
//! max_focus_files = 12
//! test_also = false
//! memory_context = 3
//!
//! [memory]
//! max_items = 500
//! path = ".codeloop/memory.json"
//!
//! [workspace]
//! debounce_ms = 400
//! store_dir = ".codeloop/workspaces"
//!
//! [bus]
//! history_capacity = 256
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::llm::CallOptions;
use crate::orchestrator::OrchestratorSettings;
use crate::runner::{RunnerSettings, default_interpreters, default_test_patterns};

pub const CONFIG_DIR: &str = ".codeloop";
pub const CONFIG_FILE: &str = "codeloop.toml";

pub const ENV_LLM_CMD: &str = "CODELOOP_LLM_CMD";
pub const ENV_MODEL: &str = "CODELOOP_MODEL";
pub const ENV_MAX_ITERS: &str = "CODELOOP_MAX_ITERS";

// ── File sections ────────────────────────────────────────────────────

/// How the model command is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_command")]
    pub command: String,
    #[serde(default = "default_llm_args")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Wall-clock limit for one model call
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_command() -> String {
    "claude".to_string()
}

fn default_llm_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_llm_timeout_secs() -> u64 {
    300
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: default_llm_command(),
            args: default_llm_args(),
            provider: None,
            model: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Timeout for `exec` runs
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Timeout for each run inside the fix loop
    #[serde(default = "default_fix_timeout_ms")]
    pub fix_timeout_ms: u64,
    #[serde(default = "default_test_patterns")]
    pub test_patterns: Vec<String>,
    /// Language tag → interpreter argv. The program is written to stdin.
    #[serde(default = "default_interpreter_map")]
    pub interpreters: BTreeMap<String, Vec<String>>,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_fix_timeout_ms() -> u64 {
    2500
}

fn default_interpreter_map() -> BTreeMap<String, Vec<String>> {
    default_interpreters().into_iter().collect()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            fix_timeout_ms: default_fix_timeout_ms(),
            test_patterns: default_test_patterns(),
            interpreters: default_interpreter_map(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_iters")]
    pub max_iters: u32,
    #[serde(default = "default_repeat_error_threshold")]
    pub repeat_error_threshold: u32,
    #[serde(default = "default_max_focus_files")]
    pub max_focus_files: usize,
    #[serde(default)]
    pub test_also: bool,
    #[serde(default = "default_memory_context")]
    pub memory_context: usize,
}

fn default_max_iters() -> u32 {
    4
}

fn default_repeat_error_threshold() -> u32 {
    1
}

fn default_max_focus_files() -> usize {
    12
}

fn default_memory_context() -> usize {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iters: default_max_iters(),
            repeat_error_threshold: default_repeat_error_threshold(),
            max_focus_files: default_max_focus_files(),
            test_also: false,
            memory_context: default_memory_context(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// JSON log file; relative paths resolve against the project directory.
    /// Defaults to `.codeloop/memory.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_max_items() -> usize {
    crate::memory::DEFAULT_MAX_ITEMS
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_debounce_ms() -> u64 {
    400
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("workspaces")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            store_dir: default_store_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    crate::bus::DEFAULT_HISTORY_CAPACITY
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// Contents of `codeloop.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeloopToml {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

impl CodeloopToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse codeloop.toml")
    }

    /// Load `codeloop.toml` from `codeloop_dir`, or defaults when absent.
    pub fn load_or_default(codeloop_dir: &Path) -> Result<Self> {
        let path = codeloop_dir.join(CONFIG_FILE);
        if path.exists() { Self::load(&path) } else { Ok(Self::default()) }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize codeloop.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Model command (env → file).
    pub fn llm_command(&self) -> String {
        env_nonempty(ENV_LLM_CMD).unwrap_or_else(|| self.llm.command.clone())
    }

    /// Model name (env → file).
    pub fn model(&self) -> Option<String> {
        env_nonempty(ENV_MODEL).or_else(|| self.llm.model.clone())
    }

    /// Iteration budget (env → file). An unparseable env value is ignored.
    pub fn max_iters(&self) -> u32 {
        env_nonempty(ENV_MAX_ITERS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.orchestrator.max_iters)
    }

    /// Check the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.llm.command.trim().is_empty() {
            warnings.push("llm.command is empty".to_string());
        }
        if let Some(t) = self.llm.temperature
            && !(0.0..=2.0).contains(&t)
        {
            warnings.push(format!("llm.temperature {} is outside 0.0..=2.0", t));
        }
        if self.llm.timeout_secs == 0 {
            warnings.push("llm.timeout_secs must be greater than 0".to_string());
        }

        if self.runner.timeout_ms == 0 {
            warnings.push("runner.timeout_ms must be greater than 0".to_string());
        }
        if self.runner.fix_timeout_ms == 0 {
            warnings.push("runner.fix_timeout_ms must be greater than 0".to_string());
        }
        for (language, argv) in &self.runner.interpreters {
            if argv.first().is_none_or(|cmd| cmd.trim().is_empty()) {
                warnings.push(format!("runner.interpreters.{} has no command", language));
            }
        }
        for pattern in &self.runner.test_patterns {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid test pattern '{}'", pattern));
            }
        }

        if self.orchestrator.max_iters == 0 {
            warnings.push("orchestrator.max_iters must be at least 1".to_string());
        }
        if self.orchestrator.repeat_error_threshold == 0 {
            warnings.push("orchestrator.repeat_error_threshold must be at least 1".to_string());
        }
        if !(1..=12).contains(&self.orchestrator.max_focus_files) {
            warnings.push(format!(
                "orchestrator.max_focus_files {} should be between 1 and 12",
                self.orchestrator.max_focus_files
            ));
        }

        if self.memory.max_items == 0 {
            warnings.push("memory.max_items must be at least 1".to_string());
        }
        if self.bus.history_capacity == 0 {
            warnings.push("bus.history_capacity of 0 disables event history".to_string());
        }

        if let Some(raw) = env_nonempty(ENV_MAX_ITERS)
            && raw.parse::<u32>().is_err()
        {
            warnings.push(format!("{}='{}' is not a number and is ignored", ENV_MAX_ITERS, raw));
        }

        warnings
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// ── Resolved configuration ───────────────────────────────────────────

/// Project configuration with every layer applied.
#[derive(Debug, Clone)]
pub struct CodeloopConfig {
    pub project_dir: PathBuf,
    pub codeloop_dir: PathBuf,
    pub toml: CodeloopToml,
    pub verbose: bool,
    pub yes: bool,
    pub cli_max_iters: Option<u32>,
    pub cli_model: Option<String>,
    pub cli_test_also: bool,
}

impl CodeloopConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let codeloop_dir = project_dir.join(CONFIG_DIR);
        let toml = CodeloopToml::load_or_default(&codeloop_dir)?;

        Ok(Self {
            project_dir,
            codeloop_dir,
            toml,
            verbose: false,
            yes: false,
            cli_max_iters: None,
            cli_model: None,
            cli_test_also: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, yes: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.yes = yes;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.codeloop_dir.join(CONFIG_FILE)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.resolve(&self.toml.workspace.store_dir)
    }

    pub fn memory_path(&self) -> PathBuf {
        match &self.toml.memory.path {
            Some(path) => self.resolve(path),
            None => self.codeloop_dir.join("memory.json"),
        }
    }

    /// Marker file naming the workspace the CLI operates on.
    pub fn current_file(&self) -> PathBuf {
        self.codeloop_dir.join("current")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.toml.workspace.debounce_ms)
    }

    pub fn history_capacity(&self) -> usize {
        self.toml.bus.history_capacity
    }

    pub fn llm_command(&self) -> String {
        self.toml.llm_command()
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.llm.timeout_secs)
    }

    /// Model options (CLI → env → file).
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            provider: self.toml.llm.provider.clone(),
            model: self.cli_model.clone().or_else(|| self.toml.model()),
            temperature: self.toml.llm.temperature,
            max_tokens: self.toml.llm.max_tokens,
        }
    }

    pub fn interpreters(&self) -> HashMap<String, Vec<String>> {
        self.toml
            .runner
            .interpreters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            default_timeout: Duration::from_millis(self.toml.runner.timeout_ms),
            test_patterns: self.toml.runner.test_patterns.clone(),
        }
    }

    /// Orchestrator settings (CLI → env → file for the iteration budget).
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let o = &self.toml.orchestrator;
        OrchestratorSettings {
            max_iters: self.cli_max_iters.unwrap_or_else(|| self.toml.max_iters()),
            repeat_error_threshold: o.repeat_error_threshold,
            max_focus_files: o.max_focus_files,
            test_also: self.cli_test_also || o.test_also,
            memory_context: o.memory_context,
            fix_timeout: Duration::from_millis(self.toml.runner.fix_timeout_ms),
            call_options: self.call_options(),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        unsafe {
            std::env::remove_var(ENV_LLM_CMD);
            std::env::remove_var(ENV_MODEL);
            std::env::remove_var(ENV_MAX_ITERS);
        }
    }

    #[test]
    fn test_defaults() {
        let toml = CodeloopToml::default();
        assert_eq!(toml.llm.command, "claude");
        assert_eq!(toml.llm.args, vec!["--print"]);
        assert_eq!(toml.runner.timeout_ms, 5000);
        assert_eq!(toml.runner.fix_timeout_ms, 2500);
        assert_eq!(toml.runner.interpreters["javascript"], vec!["node", "-"]);
        assert_eq!(toml.orchestrator.max_iters, 4);
        assert_eq!(toml.orchestrator.repeat_error_threshold, 1);
        assert_eq!(toml.orchestrator.max_focus_files, 12);
        assert_eq!(toml.memory.max_items, 500);
        assert_eq!(toml.workspace.debounce_ms, 400);
        assert_eq!(toml.bus.history_capacity, 256);
    }

    #[test]
    fn test_parse_partial_file() {
        let content = r#"
[llm]
model = "sonnet"

[orchestrator]
max_iters = 6
test_also = true
"#;
        let toml = CodeloopToml::parse(content).unwrap();
        assert_eq!(toml.llm.model.as_deref(), Some("sonnet"));
        assert_eq!(toml.llm.command, "claude");
        assert_eq!(toml.orchestrator.max_iters, 6);
        assert!(toml.orchestrator.test_also);
        assert_eq!(toml.orchestrator.memory_context, 3);
        assert_eq!(toml.runner.timeout_ms, 5000);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(CodeloopToml::parse("[llm\ncommand = ").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = CodeloopToml::default();
        toml.llm.model = Some("haiku".into());
        toml.save(&path).unwrap();
        assert_eq!(CodeloopToml::load(&path).unwrap(), toml);
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let toml = CodeloopToml::parse("[llm]\ncommand = \"file-llm\"\nmodel = \"m1\"\n").unwrap();
        assert_eq!(toml.llm_command(), "file-llm");
        assert_eq!(toml.model().as_deref(), Some("m1"));
        assert_eq!(toml.max_iters(), 4);

        unsafe {
            std::env::set_var(ENV_LLM_CMD, "env-llm");
            std::env::set_var(ENV_MODEL, "m2");
            std::env::set_var(ENV_MAX_ITERS, "7");
        }
        assert_eq!(toml.llm_command(), "env-llm");
        assert_eq!(toml.model().as_deref(), Some("m2"));
        assert_eq!(toml.max_iters(), 7);

        unsafe { std::env::set_var(ENV_MAX_ITERS, "many") };
        assert_eq!(toml.max_iters(), 4);
        assert!(toml.validate().iter().any(|w| w.contains(ENV_MAX_ITERS)));

        clear_env();
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        assert!(CodeloopToml::default().validate().is_empty());

        let content = r#"
[llm]
temperature = 3.5

[runner]
timeout_ms = 0
test_patterns = ["[unclosed"]

[runner.interpreters]
ruby = []

[orchestrator]
max_iters = 0
max_focus_files = 20
"#;
        let warnings = CodeloopToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 6, "{:?}", warnings);
    }

    #[test]
    fn test_config_resolves_paths_and_cli_layers() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let dir = tempdir().unwrap();
        let codeloop_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&codeloop_dir).unwrap();
        std::fs::write(
            codeloop_dir.join(CONFIG_FILE),
            "[memory]\npath = \"logs/memory.json\"\n[orchestrator]\nmax_iters = 3\n",
        )
        .unwrap();

        let mut config = CodeloopConfig::new(dir.path().to_path_buf()).unwrap();
        assert!(config.memory_path().ends_with("logs/memory.json"));
        assert!(config.store_dir().ends_with(".codeloop/workspaces"));
        assert_eq!(config.orchestrator_settings().max_iters, 3);

        config.cli_max_iters = Some(9);
        config.cli_model = Some("cli-model".into());
        let settings = config.orchestrator_settings();
        assert_eq!(settings.max_iters, 9);
        assert_eq!(settings.call_options.model.as_deref(), Some("cli-model"));
        assert_eq!(settings.fix_timeout, Duration::from_millis(2500));
    }
}
