//! Integration tests for crossfire
//!
//! Engines are replaced by small shell scripts configured through the
//! project's `.crossfire/crossfire.toml`.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a crossfire Command rooted in `dir`
fn crossfire(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("crossfire");
    cmd.current_dir(dir)
        .env("CROSSFIRE_HOST_ENGINE", "")
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(
        &path,
        format!(
            "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo \"{} 1.0.0\"; exit 0; fi\n{}\n",
            name, body
        ),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// Project with a failing codex and a healthy gemini.
#[cfg(unix)]
fn project_with_engines(dir: &TempDir) {
    let codex = write_script(
        dir.path(),
        "codex",
        "echo 'codex: upstream connection refused' >&2\nexit 3",
    );
    let gemini = write_script(
        dir.path(),
        "gemini",
        "cat > /dev/null\necho '{\"response\":\"No blocking issues found.\"}'",
    );
    let config = format!(
        "[engines]\nenabled = [\"codex\", \"gemini\"]\n\n[engines.commands]\ncodex = \"{}\"\ngemini = \"{}\"\n",
        codex, gemini
    );
    fs::create_dir_all(dir.path().join(".crossfire")).unwrap();
    fs::write(dir.path().join(".crossfire/crossfire.toml"), config).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_crossfire_help() {
        let dir = create_temp_project();
        crossfire(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("analyze"))
            .stdout(predicate::str::contains("engines"));
    }

    #[test]
    fn test_crossfire_version() {
        let dir = create_temp_project();
        crossfire(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_analyze_requires_target_or_text() {
        let dir = create_temp_project();
        crossfire(dir.path()).arg("analyze").assert().failure();
    }

    #[test]
    fn test_analyze_rejects_unknown_type() {
        let dir = create_temp_project();
        crossfire(dir.path())
            .args(["analyze", "--text", "x", "--type", "poetry"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_project();

        crossfire(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created crossfire.toml"));

        let path = dir.path().join(".crossfire/crossfire.toml");
        assert!(path.exists());
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("[execution]"));
        assert!(content.contains("[engines]"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".crossfire")).unwrap();
        fs::write(dir.path().join(".crossfire/crossfire.toml"), "# mine\n").unwrap();

        crossfire(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".crossfire/crossfire.toml")).unwrap();
        assert_eq!(content, "# mine\n");
    }

    #[test]
    fn test_config_validate_defaults() {
        let dir = create_temp_project();
        crossfire(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_bad_env() {
        let dir = create_temp_project();
        crossfire(dir.path())
            .env("CROSSFIRE_MAX_CONCURRENT", "lots")
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("CROSSFIRE_MAX_CONCURRENT"));
    }

    #[test]
    fn test_config_show_reflects_file_and_env() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".crossfire")).unwrap();
        fs::write(
            dir.path().join(".crossfire/crossfire.toml"),
            "[execution]\nmax_concurrent = 7\n",
        )
        .unwrap();

        crossfire(dir.path())
            .env("CROSSFIRE_DEFAULT_TIMEOUT_MS", "1234")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Config file:"))
            .stdout(predicate::str::contains("max_concurrent = 7"))
            .stdout(predicate::str::contains("default_timeout_ms = 1234"));
    }

    #[test]
    fn test_config_file_parse_error_fails() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".crossfire")).unwrap();
        fs::write(dir.path().join(".crossfire/crossfire.toml"), "[execution\n").unwrap();

        crossfire(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse crossfire.toml"));
    }
}

// =============================================================================
// Engines and analysis (fake engine scripts)
// =============================================================================

#[cfg(unix)]
mod engines {
    use super::*;

    #[test]
    fn test_engines_lists_availability() {
        let dir = create_temp_project();
        project_with_engines(&dir);

        let output = crossfire(dir.path())
            .args(["engines", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let rows: serde_json::Value = serde_json::from_slice(&output).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "codex");
        assert_eq!(rows[0]["available"], true);
        assert_eq!(rows[0]["delivery"], "argument");
        assert_eq!(rows[1]["id"], "gemini");
        assert_eq!(rows[1]["breaker"], "CLOSED");
    }

    #[test]
    fn test_engines_missing_binary_is_unavailable() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".crossfire")).unwrap();
        fs::write(
            dir.path().join(".crossfire/crossfire.toml"),
            "[engines]\nenabled = [\"gemini\"]\n\n[engines.commands]\ngemini = \"/nonexistent/gemini-cli\"\n",
        )
        .unwrap();

        crossfire(dir.path())
            .arg("engines")
            .assert()
            .success()
            .stdout(predicate::str::contains("0 of 1 engine(s) available"));
    }
}

#[cfg(unix)]
mod analyze {
    use super::*;

    #[test]
    fn test_partial_failure_still_reports() {
        let dir = create_temp_project();
        project_with_engines(&dir);

        crossfire(dir.path())
            .args(["analyze", "--text", "fn main() {}", "--type", "code"])
            .assert()
            .success()
            .stdout(predicate::str::contains("# Code Review: inline text"))
            .stdout(predicate::str::contains("No blocking issues found."))
            .stdout(predicate::str::contains("## Failed Engines"))
            .stdout(predicate::str::contains("**codex**"));
    }

    #[test]
    fn test_json_report_shape() {
        let dir = create_temp_project();
        project_with_engines(&dir);

        let output = crossfire(dir.path())
            .args(["analyze", "--text", "a plan", "--type", "idea", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(report["analysis"], "idea");
        assert_eq!(report["target"], "inline text");
        assert_eq!(report["sections"].as_array().unwrap().len(), 1);
        assert_eq!(report["sections"][0]["engine"], "gemini");
        assert_eq!(report["failures"][0]["engine"], "codex");
        assert_eq!(report["cached"], false);
        assert!(report["summary"].as_str().unwrap().contains("1 of 2"));
    }

    #[test]
    fn test_file_target_uses_path_label() {
        let dir = create_temp_project();
        project_with_engines(&dir);
        fs::write(dir.path().join("design.md"), "# Design\nUse a queue.\n").unwrap();

        crossfire(dir.path())
            .args(["analyze", "design.md", "--type", "architecture", "--engine", "gemini"])
            .assert()
            .success()
            .stdout(predicate::str::contains("design.md"))
            .stdout(predicate::str::contains("No blocking issues found."))
            .stdout(predicate::str::contains("## Failed Engines").not());
    }

    #[test]
    fn test_missing_target_file_fails() {
        let dir = create_temp_project();
        project_with_engines(&dir);

        crossfire(dir.path())
            .args(["analyze", "missing.rs"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read"));
    }

    #[test]
    fn test_all_engines_failed_exits_nonzero() {
        let dir = create_temp_project();
        project_with_engines(&dir);

        crossfire(dir.path())
            .args(["analyze", "--text", "x", "--engine", "codex"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Analysis failed on every engine"));
    }

    #[test]
    fn test_unknown_engine_exits_nonzero() {
        let dir = create_temp_project();
        project_with_engines(&dir);

        crossfire(dir.path())
            .args(["analyze", "--text", "x", "--engine", "bard"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not registered"));
    }

    #[test]
    fn test_host_engine_skipped_in_fan_out() {
        let dir = create_temp_project();
        project_with_engines(&dir);

        let output = crossfire(dir.path())
            .env("CROSSFIRE_HOST_ENGINE", "codex")
            .args(["analyze", "--text", "x", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(report["sections"][0]["engine"], "gemini");
        assert!(report["failures"].as_array().map_or(true, |f| f.is_empty()));
    }
}
