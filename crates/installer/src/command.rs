//! External command execution.
//!
//! Every subprocess the installer shells out to (`git`, `npm`, `pip`,
//! `tar`, `unzip`, build toolchains) goes through the [`CommandRunner`]
//! capability, so tests can inject a fake runner with deterministic
//! outputs. The real runner pipes stdio, enforces a per-command timeout,
//! and treats any non-zero exit as a stage failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use stevedore_domain::error::{Error, Result};

/// One external command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg arg ...` for logs and progress events.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// What a finished command produced.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Capability seam for external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion within the spec's timeout. Returns `Ok` even for
    /// non-zero exits; callers decide what failure means per stage.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Convenience: run and fail on non-zero exit.
pub async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(spec).await?;
    if !output.success() {
        return Err(Error::install(format!(
            "command '{}' exited with {:?}: {}",
            spec.display(),
            output.code,
            output.stderr.lines().last().unwrap_or("")
        )));
    }
    Ok(output)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProcessRunner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Real subprocess execution via tokio.
#[derive(Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        tracing::debug!(command = %spec.display(), cwd = ?spec.cwd, "running external command");

        let child = cmd
            .spawn()
            .map_err(|e| Error::install(format!("failed to spawn '{}': {e}", spec.program)))?;

        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| Error::install(format!("'{}': {e}", spec.display())))?
            }
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                return Err(Error::install(format!(
                    "command '{}' timed out after {:?}",
                    spec.display(),
                    spec.timeout
                )));
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(
            command = %spec.display(),
            code = result.code,
            "external command finished"
        );
        Ok(result)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FakeRunner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic runner for tests: scripted outputs matched by program
/// name (and optionally a substring of the argument list), with a log of
/// everything that ran.
pub struct FakeRunner {
    rules: parking_lot::Mutex<Vec<FakeRule>>,
    pub calls: parking_lot::Mutex<Vec<String>>,
}

struct FakeRule {
    program: String,
    args_contains: Option<String>,
    output: CommandOutput,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            rules: parking_lot::Mutex::new(Vec::new()),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Any invocation of `program` succeeds with empty output.
    pub fn ok(self, program: &str) -> Self {
        self.rule(program, None, CommandOutput { code: Some(0), ..Default::default() })
    }

    /// Any invocation of `program` fails with the given exit code.
    pub fn fail(self, program: &str, code: i32) -> Self {
        self.rule(
            program,
            None,
            CommandOutput {
                code: Some(code),
                stderr: format!("{program}: scripted failure"),
                ..Default::default()
            },
        )
    }

    /// Invocations of `program` whose joined args contain `needle`.
    pub fn on(self, program: &str, needle: &str, output: CommandOutput) -> Self {
        self.rule(program, Some(needle.to_owned()), output)
    }

    fn rule(self, program: &str, args_contains: Option<String>, output: CommandOutput) -> Self {
        self.rules.lock().push(FakeRule {
            program: program.to_owned(),
            args_contains,
            output,
        });
        self
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().push(spec.display());
        let joined = spec.args.join(" ");
        let rules = self.rules.lock();
        for rule in rules.iter() {
            if rule.program != spec.program {
                continue;
            }
            if let Some(needle) = &rule.args_contains {
                if !joined.contains(needle.as_str()) {
                    continue;
                }
            }
            return Ok(rule.output.clone());
        }
        // Unscripted commands succeed silently; tests opt in to failures.
        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_runner_captures_output() {
        let runner = ProcessRunner;
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn process_runner_reports_exit_code() {
        let runner = ProcessRunner;
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn process_runner_times_out() {
        let runner = ProcessRunner;
        let err = runner
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "sleep 10"])
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn run_checked_fails_on_nonzero() {
        let runner = FakeRunner::new().fail("git", 128);
        let err = run_checked(&runner, &CommandSpec::new("git").args(["clone", "x"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("git"));
    }

    #[tokio::test]
    async fn fake_runner_matches_rules_in_order() {
        let runner = FakeRunner::new()
            .on(
                "npm",
                "run build",
                CommandOutput {
                    code: Some(1),
                    ..Default::default()
                },
            )
            .ok("npm");
        let build = runner
            .run(&CommandSpec::new("npm").args(["run", "build"]))
            .await
            .unwrap();
        assert_eq!(build.code, Some(1));
        let install = runner
            .run(&CommandSpec::new("npm").args(["install"]))
            .await
            .unwrap();
        assert_eq!(install.code, Some(0));
        assert_eq!(runner.call_log().len(), 2);
    }
}
