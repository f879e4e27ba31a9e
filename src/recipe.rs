//! Recipe steps: placeholder expansion, subprocess execution and output
//! assertions.
//!
//! Steps never go through a shell. A recipe that needs shell features spells
//! it out, e.g. `command = "sh"`, `args = ["-c", "..."]`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;
use crate::error::{FormaError, Result};
use crate::formula::{Step, STD_CARGO_ARGS};

/// Values substituted into `{placeholder}` tokens of a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub name: String,
    pub version: String,
    /// The keg directory the recipe installs into.
    pub prefix: PathBuf,
    /// The extracted source tree.
    pub source: PathBuf,
    /// Directories prepended to `PATH` for every step.
    pub path_prepend: Vec<PathBuf>,
}

impl StepContext {
    pub fn bin(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    /// Replaces every known `{placeholder}` in `text`.
    pub fn interpolate(&self, text: &str) -> String {
        text.replace("{name}", &self.name)
            .replace("{version}", &self.version)
            .replace("{bin}", &self.bin().to_string_lossy())
            .replace("{prefix}", &self.prefix.to_string_lossy())
            .replace("{source}", &self.source.to_string_lossy())
    }

    /// Expands a step's arguments. A whole `{std_cargo_args}` argument becomes
    /// the standard `cargo install` arguments for this keg.
    pub fn expand_args(&self, args: &[String]) -> Vec<String> {
        let mut expanded = Vec::with_capacity(args.len());
        for arg in args {
            if arg == STD_CARGO_ARGS {
                expanded.push("--locked".to_string());
                expanded.push(format!("--root={}", self.prefix.display()));
                expanded.push("--path=.".to_string());
            } else {
                expanded.push(self.interpolate(arg));
            }
        }
        expanded
    }

    fn search_path(&self) -> Option<OsString> {
        let dirs = self
            .path_prepend
            .iter()
            .cloned()
            .chain(crate::util::parse_system_path());
        std::env::join_paths(dirs).ok()
    }
}

/// Captured result of one step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// None if the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// Outcome of a test recipe that passed.
#[derive(Debug, Clone, Default)]
pub struct TestReport {
    /// Number of steps that ran and passed.
    pub passed: usize,
}

/// Runs one step in `cwd` and captures its output.
///
/// # Errors
/// Returns the I/O error if the process could not be started.
pub fn run_step(step: &Step, ctx: &StepContext, cwd: &Path) -> std::io::Result<StepOutput> {
    let program = resolve_program(&ctx.interpolate(&step.command), cwd);
    let args = ctx.expand_args(&step.args);
    debug!("running {} {:?} in {}", program.display(), args, cwd.display());

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(path) = ctx.search_path() {
        cmd.env("PATH", path);
    }
    let output = cmd.output()?;

    Ok(StepOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Relative paths with a separator are taken relative to the step's working
/// directory. Bare names are looked up on `PATH`.
fn resolve_program(command: &str, cwd: &Path) -> PathBuf {
    let path = PathBuf::from(command);
    if path.is_relative() && path.components().count() > 1 {
        cwd.join(path)
    } else {
        path
    }
}

/// Runs install steps in order, stopping at the first failure.
///
/// Returns the number of steps that ran.
///
/// # Errors
/// Returns [`FormaError::BuildStep`] for the first step that could not start or
/// exited non-zero.
pub fn run_install_recipe(steps: &[Step], ctx: &StepContext, cwd: &Path) -> Result<usize> {
    for (i, step) in steps.iter().enumerate() {
        let index = i + 1;
        let command = ctx.interpolate(&step.command_line());
        let output = run_step(step, ctx, cwd).map_err(|e| FormaError::BuildStep {
            step: index,
            command: command.clone(),
            exit_code: None,
            detail: format!("could not start: {e}"),
        })?;
        if !output.success() {
            return Err(FormaError::BuildStep {
                step: index,
                command,
                exit_code: output.exit_code,
                detail: failure_detail(&output),
            });
        }
        debug!("install step {index} done");
    }
    Ok(steps.len())
}

/// Runs test steps in order, asserting exit status and expected output.
///
/// # Errors
/// Returns [`FormaError::TestAssertion`] for the first step that fails.
pub fn run_test_recipe(steps: &[Step], ctx: &StepContext, cwd: &Path) -> Result<TestReport> {
    let mut report = TestReport::default();
    for (i, step) in steps.iter().enumerate() {
        let index = i + 1;
        let command = ctx.interpolate(&step.command_line());
        let output = run_step(step, ctx, cwd).map_err(|e| FormaError::TestAssertion {
            step: index,
            command: command.clone(),
            reason: format!("could not start: {e}"),
        })?;
        check_step_output(index, &command, step, &output)?;
        report.passed += 1;
    }
    Ok(report)
}

/// Asserts a test step's exit status, and that its output contains the
/// expected text verbatim.
pub fn check_step_output(index: usize, command: &str, step: &Step, output: &StepOutput) -> Result<()> {
    if output.exit_code != Some(step.status) {
        return Err(FormaError::TestAssertion {
            step: index,
            command: command.to_string(),
            reason: format!(
                "expected exit status {}, got {}",
                step.status,
                describe_exit(output.exit_code)
            ),
        });
    }
    let Some(expected) = &step.expect else {
        return Ok(());
    };
    let combined = output.combined();
    if combined.contains(expected.as_str()) {
        Ok(())
    } else {
        Err(FormaError::TestAssertion {
            step: index,
            command: command.to_string(),
            reason: format!(
                "expected output containing '{expected}', got: {}",
                excerpt(&combined)
            ),
        })
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "termination by signal".to_string(),
    }
}

fn failure_detail(output: &StepOutput) -> String {
    let status = match output.exit_code {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    };
    let tail = excerpt(&output.stderr);
    if tail.is_empty() {
        status
    } else {
        format!("{status}: {tail}")
    }
}

/// Last few lines of output, trimmed.
fn excerpt(text: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext {
        StepContext {
            name: "white-dragon".to_string(),
            version: "0.1.2".to_string(),
            prefix: PathBuf::from("/opt/forma/Cellar/white-dragon/0.1.2"),
            source: PathBuf::from("/tmp/src"),
            path_prepend: Vec::new(),
        }
    }

    fn output(code: i32, stdout: &str) -> StepOutput {
        StepOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn interpolates_placeholders() {
        let ctx = ctx();
        assert_eq!(
            ctx.interpolate("{bin}/{name}"),
            "/opt/forma/Cellar/white-dragon/0.1.2/bin/white-dragon"
        );
        assert_eq!(ctx.interpolate("v{version} from {source}"), "v0.1.2 from /tmp/src");
    }

    #[test]
    fn expands_std_cargo_args() {
        let args = vec!["install".to_string(), "{std_cargo_args}".to_string()];
        assert_eq!(
            ctx().expand_args(&args),
            vec![
                "install",
                "--locked",
                "--root=/opt/forma/Cellar/white-dragon/0.1.2",
                "--path=.",
            ]
        );
    }

    #[test]
    fn expected_output_found() {
        let step = Step::new("white-dragon", &["--help"]).expecting("white-dragon");
        let out = output(0, "white-dragon 0.1.2 drag and drop\n");
        assert!(check_step_output(1, "white-dragon --help", &step, &out).is_ok());
    }

    #[test]
    fn expected_output_missing() {
        let step = Step::new("white-dragon", &["--help"]).expecting("black-dragon");
        let out = output(0, "white-dragon 0.1.2 drag and drop\n");
        let err = check_step_output(1, "white-dragon --help", &step, &out).unwrap_err();
        match err {
            FormaError::TestAssertion { step, reason, .. } => {
                assert_eq!(step, 1);
                assert!(reason.contains("black-dragon"));
                assert!(reason.contains("white-dragon 0.1.2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unexpected_status_fails() {
        let step = Step::new("tool", &[]);
        let err = check_step_output(3, "tool", &step, &output(1, "")).unwrap_err();
        assert_eq!(err.kind(), "TestAssertionError");
        assert!(err.to_string().contains("expected exit status 0, got 1"));
    }

    #[test]
    fn expected_text_found_on_stderr() {
        let step = Step::new("tool", &[]).expecting("usage:");
        let out = StepOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: "usage: tool [FLAGS]".to_string(),
        };
        assert!(check_step_output(1, "tool", &step, &out).is_ok());
    }

    #[test]
    fn expected_text_is_literal() {
        let step = Step::new("tool", &["--version"]).expecting("0.1.2");
        let err = check_step_output(1, "tool --version", &step, &output(0, "white-dragon 0x1y2\n"))
            .unwrap_err();
        assert_eq!(err.kind(), "TestAssertionError");

        let step = Step::new("tool", &["--help"]).expecting("[FLAGS]");
        assert!(check_step_output(1, "tool --help", &step, &output(0, "tool [FLAGS]\n")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn install_recipe_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("third-ran");
        let steps = vec![
            Step::new("true", &[]),
            Step::new("sh", &["-c", "echo boom >&2; exit 3"]),
            Step::new("touch", &[marker.to_str().unwrap()]),
        ];
        let err = run_install_recipe(&steps, &ctx(), dir.path()).unwrap_err();
        match err {
            FormaError::BuildStep { step, exit_code, detail, .. } => {
                assert_eq!(step, 2);
                assert_eq!(exit_code, Some(3));
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn missing_program_is_build_step_error() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![Step::new("forma-no-such-program", &[])];
        let err = run_install_recipe(&steps, &ctx(), dir.path()).unwrap_err();
        match err {
            FormaError::BuildStep { step, exit_code, .. } => {
                assert_eq!(step, 1);
                assert_eq!(exit_code, None);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn steps_run_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![Step::new("pwd", &[]).expecting(
            dir.path().file_name().unwrap().to_str().unwrap(),
        )];
        let report = run_test_recipe(&steps, &ctx(), dir.path()).unwrap();
        assert_eq!(report.passed, 1);
    }
}
