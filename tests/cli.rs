//! Integration tests for the codeloop CLI
//!
//! The model is replaced by a shell script that prints a canned reply, so
//! these tests need no network and no model CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper to create a codeloop Command with a clean model environment
fn codeloop(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("codeloop");
    cmd.current_dir(dir.path())
        .env_remove("CODELOOP_LLM_CMD")
        .env_remove("CODELOOP_MODEL")
        .env_remove("CODELOOP_MAX_ITERS")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_workspace(dir: &TempDir) {
    codeloop(dir).args(["init", "--template", "node"]).assert().success();
}

/// Write an executable model stand-in that ignores its prompt and prints `reply`.
#[cfg(unix)]
fn fake_llm(dir: &Path, reply: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-llm.sh");
    let script = format!("#!/bin/sh\ncat > /dev/null\ncat <<'EOF'\n{}\nEOF\n", reply);
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const UTIL_EDIT: &str = r#"{"notes":"shorter greeting","edits":[{"path":"util.js","newContent":"function greet(name) {\n  return 'Hi ' + name;\n}\n\nmodule.exports = { greet };\n"}]}"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        cargo_bin_cmd!("codeloop")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("fix"));
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("codeloop").arg("--version").assert().success();
    }
}

// =============================================================================
// Workspace Tests
// =============================================================================

mod workspaces {
    use super::*;

    #[test]
    fn test_init_creates_and_selects_workspace() {
        let dir = create_temp_project();

        codeloop(&dir)
            .args(["init", "--template", "node", "--name", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created workspace"))
            .stdout(predicate::str::contains("entry: main.js"));

        assert!(dir.path().join(".codeloop/current").exists());
        assert!(dir.path().join(".codeloop/workspaces/index.json").exists());

        codeloop(&dir)
            .arg("workspaces")
            .assert()
            .success()
            .stdout(predicate::str::contains("demo"))
            .stdout(predicate::str::contains("*"));
    }

    #[test]
    fn test_init_unknown_template() {
        let dir = create_temp_project();

        codeloop(&dir)
            .args(["init", "--template", "cobol"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown template"));
    }

    #[test]
    fn test_workspaces_empty() {
        let dir = create_temp_project();

        codeloop(&dir)
            .arg("workspaces")
            .assert()
            .success()
            .stdout(predicate::str::contains("No workspaces yet"));
    }

    #[test]
    fn test_export_writes_files() {
        let dir = create_temp_project();
        init_workspace(&dir);
        let out = dir.path().join("out");

        codeloop(&dir)
            .arg("export")
            .arg(&out)
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote 2 file(s)"));

        let main = fs::read_to_string(out.join("main.js")).unwrap();
        assert!(main.contains("require('./util')"));
        assert!(out.join("util.js").exists());
    }

    #[test]
    fn test_import_directory() {
        let dir = create_temp_project();
        let src = dir.path().join("src-project");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(src.join("main.py"), "print('hi')\n").unwrap();
        fs::write(src.join("lib/helpers.py"), "X = 1\n").unwrap();

        codeloop(&dir)
            .arg("import")
            .arg(&src)
            .assert()
            .success()
            .stdout(predicate::str::contains("Imported workspace"))
            .stdout(predicate::str::contains("2 file(s)"))
            .stdout(predicate::str::contains("entry: main.py"));
    }

    #[test]
    fn test_commands_need_a_workspace() {
        let dir = create_temp_project();

        codeloop(&dir)
            .args(["plan", "add logging"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No workspace selected"));
    }
}

// =============================================================================
// Exec Tests
// =============================================================================

#[cfg(unix)]
mod exec {
    use super::*;

    fn shell_project(dir: &TempDir, script: &str) {
        let codeloop_dir = dir.path().join(".codeloop");
        fs::create_dir_all(&codeloop_dir).unwrap();
        fs::write(
            codeloop_dir.join("codeloop.toml"),
            "[runner.interpreters]\nshell = [\"sh\"]\n",
        )
        .unwrap();

        let src = dir.path().join("proj");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("run.sh"), script).unwrap();
        codeloop(dir).arg("import").arg(&src).assert().success();
    }

    #[test]
    fn test_exec_streams_output() {
        let dir = create_temp_project();
        shell_project(&dir, "echo hello from sandbox\n");

        codeloop(&dir)
            .args(["exec", "run.sh"])
            .assert()
            .success()
            .stdout(predicate::str::contains("hello from sandbox"));
    }

    #[test]
    fn test_exec_reports_exit_code() {
        let dir = create_temp_project();
        shell_project(&dir, "echo broken 1>&2\nexit 3\n");

        codeloop(&dir)
            .args(["exec", "run.sh"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("broken"))
            .stderr(predicate::str::contains("exited with code 3"));
    }
}

// =============================================================================
// Agent Task Tests
// =============================================================================

#[cfg(unix)]
mod tasks {
    use super::*;

    #[test]
    fn test_edit_with_yes_applies_changes() {
        let dir = create_temp_project();
        init_workspace(&dir);
        let llm = fake_llm(dir.path(), UTIL_EDIT);

        codeloop(&dir)
            .env("CODELOOP_LLM_CMD", &llm)
            .args(["--yes", "edit", "shorten the greeting", "--focus", "util.js"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Proposed changes"))
            .stdout(predicate::str::contains("util.js"))
            .stdout(predicate::str::contains("Applied 1 change(s)"));

        let out = dir.path().join("out");
        codeloop(&dir).arg("export").arg(&out).assert().success();
        let util = fs::read_to_string(out.join("util.js")).unwrap();
        assert!(util.contains("'Hi ' + name"));

        codeloop(&dir)
            .args(["memory", "search", "greeting"])
            .assert()
            .success()
            .stdout(predicate::str::contains("shorten the greeting"))
            .stdout(predicate::str::contains("success"));
    }

    #[test]
    fn test_edit_without_confirmation_discards() {
        let dir = create_temp_project();
        init_workspace(&dir);
        let llm = fake_llm(dir.path(), UTIL_EDIT);

        codeloop(&dir)
            .env("CODELOOP_LLM_CMD", &llm)
            .args(["edit", "shorten the greeting", "--focus", "util.js"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Changes discarded"));

        let out = dir.path().join("out");
        codeloop(&dir).arg("export").arg(&out).assert().success();
        let util = fs::read_to_string(out.join("util.js")).unwrap();
        assert!(util.contains("Hello, ${name}!"));

        codeloop(&dir)
            .args(["memory", "search", "greeting"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cancelled"));
    }

    #[test]
    fn test_plan_prints_focus() {
        let dir = create_temp_project();
        init_workspace(&dir);
        let llm = fake_llm(
            dir.path(),
            r#"{"notes":"util owns the text","focusPaths":["util.js","missing.js"]}"#,
        );

        codeloop(&dir)
            .env("CODELOOP_LLM_CMD", &llm)
            .args(["plan", "change the greeting"])
            .assert()
            .success()
            .stdout(predicate::str::contains("util.js"))
            .stdout(predicate::str::contains("missing.js").not())
            .stdout(predicate::str::contains("util owns the text"));
    }

    #[test]
    fn test_failing_model_command_fails_task() {
        let dir = create_temp_project();
        init_workspace(&dir);

        codeloop(&dir)
            .env("CODELOOP_LLM_CMD", "false")
            .args(["edit", "anything", "--focus", "main.js"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("error:"))
            .stderr(predicate::str::contains("failed"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_then_show() {
        let dir = create_temp_project();

        codeloop(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created codeloop.toml"));
        assert!(dir.path().join(".codeloop/codeloop.toml").exists());

        codeloop(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        codeloop(&dir)
            .env("CODELOOP_MODEL", "env-model")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_iters = 4"))
            .stdout(predicate::str::contains("model = \"env-model\""));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        let codeloop_dir = dir.path().join(".codeloop");
        fs::create_dir_all(&codeloop_dir).unwrap();
        fs::write(codeloop_dir.join("codeloop.toml"), "[orchestrator]\nmax_iters = 0\n").unwrap();

        codeloop(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_iters must be at least 1"));
    }

    #[test]
    fn test_config_validate_defaults() {
        let dir = create_temp_project();

        codeloop(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }
}

// =============================================================================
// Memory Tests
// =============================================================================

mod memory {
    use super::*;

    #[test]
    fn test_memory_stats_empty() {
        let dir = create_temp_project();

        codeloop(&dir)
            .args(["memory", "stats"])
            .assert()
            .success()
            .stdout(predicate::str::contains("items:         0"));
    }

    #[test]
    fn test_memory_import_then_related() {
        let dir = create_temp_project();
        let export = r#"{
  "version": 1,
  "exportedAt": "2026-01-01T00:00:00Z",
  "items": [
    {"id": "a", "createdAt": "2026-01-01T00:00:00Z", "updatedAt": "2026-01-01T00:00:00Z",
     "goal": "fix crash in parser", "outcome": "success", "tags": ["parser"],
     "category": "bugfix", "filesModified": ["parser.js"]},
    {"id": "b", "createdAt": "2026-01-02T00:00:00Z", "updatedAt": "2026-01-02T00:00:00Z",
     "goal": "fix parser edge case", "outcome": "fail", "tags": ["parser"],
     "category": "bugfix", "filesModified": ["parser.js"]}
  ]
}"#;
        let file = dir.path().join("memory-export.json");
        fs::write(&file, export).unwrap();

        codeloop(&dir)
            .args(["memory", "import"])
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("2 added"));

        codeloop(&dir)
            .args(["memory", "related", "a"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fix parser edge case"));

        codeloop(&dir)
            .args(["memory", "related", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No remembered task"));
    }
}
