//! Dependency installation, build execution, and output validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use stevedore_domain::error::{Error, Result};

use crate::analyze::{BuildSystem, ProjectAnalysis};
use crate::command::{run_checked, CommandRunner, CommandSpec};

/// Entry files expected at a Node output root.
const NODE_ENTRY_FILES: &[&str] = &["index.js", "main.js", "server.js", "app.js"];

/// Install dependencies for whatever the analysis found. Python installs
/// are best-effort; a Node install failure is fatal.
pub async fn install_dependencies(
    dir: &Path,
    analysis: &ProjectAnalysis,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<()> {
    if let Some(node) = &analysis.node {
        let (program, args) = node.package_manager.install_command();
        let spec = CommandSpec::new(program)
            .args(args.iter().copied())
            .cwd(dir)
            .timeout(timeout);
        run_checked(runner, &spec).await?;
    }

    if analysis.python {
        if dir.join("requirements.txt").exists() {
            let spec = CommandSpec::new("pip")
                .args(["install", "-r", "requirements.txt"])
                .cwd(dir)
                .timeout(timeout);
            if let Err(e) = run_checked(runner, &spec).await {
                tracing::warn!(error = %e, "pip requirements install failed, continuing");
            }
        }
        let spec = CommandSpec::new("pip")
            .args(["install", "-e", "."])
            .cwd(dir)
            .timeout(timeout);
        if let Err(e) = run_checked(runner, &spec).await {
            tracing::warn!(error = %e, "pip editable install failed, continuing");
        }
    }

    Ok(())
}

/// Try each of the build system's commands until one succeeds, then locate
/// the output directory. Failing every command is fatal.
pub async fn run_build(
    dir: &Path,
    system: BuildSystem,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<Option<PathBuf>> {
    let mut failures = Vec::new();
    for command in system.build_commands() {
        let Some((program, args)) = command.split_first() else {
            continue;
        };
        let spec = CommandSpec::new(*program)
            .args(args.iter().copied())
            .cwd(dir)
            .timeout(timeout);
        let output = runner.run(&spec).await?;
        if output.success() {
            tracing::info!(command = %spec.display(), ?system, "build succeeded");
            return Ok(find_output_dir(dir, system));
        }
        tracing::debug!(
            command = %spec.display(),
            code = output.code,
            "build command failed, trying next"
        );
        failures.push(format!("{} (exit {:?})", spec.display(), output.code));
    }
    Err(Error::install(format!(
        "all build commands failed for {system:?}: {}",
        failures.join("; ")
    )))
}

/// The first candidate output directory that exists.
pub fn find_output_dir(dir: &Path, system: BuildSystem) -> Option<PathBuf> {
    system
        .output_dirs()
        .iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| path.is_dir())
}

/// The output directory must exist and be non-empty. For Node trees the
/// absence of a conventional entry file is a warning, not a failure.
pub fn validate_output(output: &Path, is_node: bool) -> Result<Vec<String>> {
    if !output.is_dir() {
        return Err(Error::install(format!(
            "build output directory missing: {}",
            output.display()
        )));
    }
    let non_empty = std::fs::read_dir(output)?.next().is_some();
    if !non_empty {
        return Err(Error::install(format!(
            "build output directory is empty: {}",
            output.display()
        )));
    }

    let mut warnings = Vec::new();
    if is_node && !NODE_ENTRY_FILES.iter().any(|f| output.join(f).exists()) {
        warnings.push(format!(
            "no conventional entry file ({}) at output root",
            NODE_ENTRY_FILES.join(", ")
        ));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze;
    use crate::command::{CommandOutput, FakeRunner};
    use std::fs;

    #[tokio::test]
    async fn node_dependency_install_uses_lockfile_manager() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("package.json"), "{}").unwrap();
        fs::write(tmp.path().join("yarn.lock"), "").unwrap();
        let analysis = analyze(tmp.path());

        let runner = FakeRunner::new().ok("yarn");
        install_dependencies(tmp.path(), &analysis, &runner, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(runner.call_log(), vec!["yarn install"]);
    }

    #[tokio::test]
    async fn python_install_failures_are_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("requirements.txt"), "x\n").unwrap();
        let analysis = analyze(tmp.path());

        let runner = FakeRunner::new().fail("pip", 1);
        install_dependencies(tmp.path(), &analysis, &runner, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(runner.call_log().len(), 2);
    }

    #[tokio::test]
    async fn build_tries_commands_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("dist")).unwrap();

        // npm run build fails; yarn build succeeds.
        let runner = FakeRunner::new()
            .on(
                "npm",
                "run build",
                CommandOutput {
                    code: Some(1),
                    ..Default::default()
                },
            )
            .ok("yarn");
        let output = run_build(
            tmp.path(),
            BuildSystem::Typescript,
            &runner,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(output.unwrap(), tmp.path().join("dist"));
        assert_eq!(runner.call_log(), vec!["npm run build", "yarn build"]);
    }

    #[tokio::test]
    async fn build_fails_when_every_command_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new()
            .fail("npm", 1)
            .fail("yarn", 1)
            .fail("tsc", 1)
            .fail("bun", 1);
        let err = run_build(
            tmp.path(),
            BuildSystem::Typescript,
            &runner,
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("all build commands failed"));
    }

    #[test]
    fn output_dir_search_order() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("lib")).unwrap();
        fs::create_dir_all(tmp.path().join("build")).unwrap();
        // "build" precedes "lib" in the typescript candidate list.
        assert_eq!(
            find_output_dir(tmp.path(), BuildSystem::Typescript).unwrap(),
            tmp.path().join("build")
        );
    }

    #[test]
    fn validate_rejects_missing_or_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(validate_output(&tmp.path().join("nope"), false).is_err());

        let empty = tmp.path().join("dist");
        fs::create_dir_all(&empty).unwrap();
        assert!(validate_output(&empty, false).is_err());
    }

    #[test]
    fn validate_warns_on_missing_node_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let dist = tmp.path().join("dist");
        fs::create_dir_all(&dist).unwrap();
        fs::write(dist.join("other.js"), "x").unwrap();

        let warnings = validate_output(&dist, true).unwrap();
        assert_eq!(warnings.len(), 1);

        fs::write(dist.join("index.js"), "x").unwrap();
        assert!(validate_output(&dist, true).unwrap().is_empty());
    }
}
