//! Project analysis: what kind of tree did we just acquire, and how does
//! it build?
//!
//! Detection is sentinel-file driven. The build-system table is ordered;
//! the first system whose sentinel exists wins.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Package managers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Yarn,
    Pnpm,
    Bun,
}

impl PackageManager {
    /// Inferred from the lockfile present at the project root.
    pub fn detect(root: &Path) -> Self {
        if root.join("yarn.lock").exists() {
            Self::Yarn
        } else if root.join("pnpm-lock.yaml").exists() {
            Self::Pnpm
        } else if root.join("bun.lockb").exists() {
            Self::Bun
        } else {
            Self::Npm
        }
    }

    pub fn install_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Npm => ("npm", &["install"]),
            Self::Yarn => ("yarn", &["install"]),
            Self::Pnpm => ("pnpm", &["install"]),
            Self::Bun => ("bun", &["install"]),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Build systems
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    Typescript,
    Webpack,
    Rollup,
    Vite,
    Esbuild,
    Python,
    Rust,
    Go,
}

impl BuildSystem {
    /// First matching sentinel wins, in table order.
    pub fn detect(root: &Path) -> Option<Self> {
        const TABLE: &[(BuildSystem, &[&str])] = &[
            (BuildSystem::Typescript, &["tsconfig.json"]),
            (BuildSystem::Webpack, &["webpack.config.js", "webpack.config.ts"]),
            (BuildSystem::Rollup, &["rollup.config.js", "rollup.config.ts"]),
            (BuildSystem::Vite, &["vite.config.js", "vite.config.ts"]),
            (BuildSystem::Esbuild, &["esbuild.config.js", "build.js"]),
            (BuildSystem::Python, &["setup.py", "pyproject.toml", "setup.cfg"]),
            (BuildSystem::Rust, &["Cargo.toml"]),
            (BuildSystem::Go, &["go.mod"]),
        ];
        for (system, sentinels) in TABLE {
            if sentinels.iter().any(|s| root.join(s).exists()) {
                return Some(*system);
            }
        }
        None
    }

    /// Build commands to try in order; the first success wins.
    pub fn build_commands(&self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Typescript => &[
                &["npm", "run", "build"],
                &["yarn", "build"],
                &["tsc"],
                &["bun", "run", "build"],
            ],
            Self::Webpack => &[
                &["npm", "run", "build"],
                &["yarn", "build"],
                &["webpack"],
                &["bun", "run", "build"],
            ],
            Self::Rollup => &[
                &["npm", "run", "build"],
                &["yarn", "build"],
                &["rollup", "-c"],
                &["bun", "run", "build"],
            ],
            Self::Vite => &[
                &["npm", "run", "build"],
                &["yarn", "build"],
                &["vite", "build"],
                &["bun", "run", "build"],
            ],
            Self::Esbuild => &[
                &["npm", "run", "build"],
                &["yarn", "build"],
                &["esbuild"],
                &["bun", "run", "build"],
            ],
            Self::Python => &[
                &["pip", "install", "-e", "."],
                &["python", "setup.py", "install"],
                &["poetry", "install"],
            ],
            Self::Rust => &[&["cargo", "build", "--release"]],
            Self::Go => &[&["go", "build"], &["go", "install"]],
        }
    }

    /// Candidate output directories, searched in order.
    pub fn output_dirs(&self) -> &'static [&'static str] {
        match self {
            Self::Typescript => &["dist", "build", "lib", "out"],
            Self::Webpack | Self::Rollup | Self::Vite | Self::Esbuild => &["dist", "build"],
            Self::Python => &["build", "dist"],
            Self::Rust => &["target/release"],
            Self::Go => &["bin"],
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project analysis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parsed facts about a Node project.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeProject {
    pub name: Option<String>,
    pub dependencies: Vec<String>,
    pub dev_dependencies: Vec<String>,
    pub scripts: BTreeMap<String, String>,
    /// Executable names from `package.json` `bin`.
    pub bin_names: Vec<String>,
    pub package_manager: PackageManager,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectAnalysis {
    pub node: Option<NodeProject>,
    pub python: bool,
    pub build_system: Option<BuildSystem>,
}

impl ProjectAnalysis {
    pub fn is_node(&self) -> bool {
        self.node.is_some()
    }
}

/// Inspect the files at the project root.
pub fn analyze(root: &Path) -> ProjectAnalysis {
    let node = read_package_json(root);
    let python = ["requirements.txt", "setup.py", "pyproject.toml"]
        .iter()
        .any(|f| root.join(f).exists());
    let build_system = BuildSystem::detect(root);

    tracing::debug!(
        root = %root.display(),
        node = node.is_some(),
        python,
        ?build_system,
        "project analyzed"
    );

    ProjectAnalysis {
        node,
        python,
        build_system,
    }
}

fn read_package_json(root: &Path) -> Option<NodeProject> {
    let raw = std::fs::read_to_string(root.join("package.json")).ok()?;
    let pkg: serde_json::Value = serde_json::from_str(&raw).ok()?;

    let keys = |field: &str| -> Vec<String> {
        pkg.get(field)
            .and_then(|v| v.as_object())
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    };

    let scripts = pkg
        .get("scripts")
        .and_then(|v| v.as_object())
        .map(|o| {
            o.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default();

    let name = pkg.get("name").and_then(|v| v.as_str()).map(str::to_owned);

    // `bin` may be a string (single unnamed binary) or a name→path map.
    let bin_names = match pkg.get("bin") {
        Some(serde_json::Value::String(_)) => {
            name.clone().into_iter().collect()
        }
        Some(serde_json::Value::Object(o)) => o.keys().cloned().collect(),
        _ => Vec::new(),
    };

    Some(NodeProject {
        name,
        dependencies: keys("dependencies"),
        dev_dependencies: keys("devDependencies"),
        scripts,
        bin_names,
        package_manager: PackageManager::detect(root),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn detects_node_project_with_lockfile() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("package.json"),
            r#"{
                "name": "my-server",
                "dependencies": { "a": "1" },
                "devDependencies": { "b": "2" },
                "scripts": { "start": "node index.js", "build": "tsc" },
                "bin": { "my-server": "dist/cli.js" }
            }"#,
        )
        .unwrap();
        fs::write(tmp.path().join("pnpm-lock.yaml"), "").unwrap();

        let analysis = analyze(tmp.path());
        let node = analysis.node.unwrap();
        assert_eq!(node.name.as_deref(), Some("my-server"));
        assert_eq!(node.dependencies, vec!["a"]);
        assert_eq!(node.dev_dependencies, vec!["b"]);
        assert_eq!(node.scripts.get("start").unwrap(), "node index.js");
        assert_eq!(node.bin_names, vec!["my-server"]);
        assert_eq!(node.package_manager, PackageManager::Pnpm);
    }

    #[test]
    fn string_bin_uses_package_name() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("package.json"),
            r#"{ "name": "solo", "bin": "cli.js" }"#,
        )
        .unwrap();
        let node = analyze(tmp.path()).node.unwrap();
        assert_eq!(node.bin_names, vec!["solo"]);
    }

    #[test]
    fn lockfile_precedence_defaults_to_npm() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Npm);
        fs::write(tmp.path().join("bun.lockb"), "").unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Bun);
        fs::write(tmp.path().join("yarn.lock"), "").unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Yarn);
    }

    #[test]
    fn detects_python_project() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("requirements.txt"), "requests\n").unwrap();
        let analysis = analyze(tmp.path());
        assert!(analysis.python);
        assert!(analysis.node.is_none());
    }

    #[test]
    fn build_system_table_order() {
        let tmp = tempfile::tempdir().unwrap();
        // Both present: typescript sentinel wins over rust.
        fs::write(tmp.path().join("Cargo.toml"), "").unwrap();
        fs::write(tmp.path().join("tsconfig.json"), "{}").unwrap();
        assert_eq!(BuildSystem::detect(tmp.path()), Some(BuildSystem::Typescript));
    }

    #[test]
    fn build_system_sentinels() {
        let cases: &[(&str, BuildSystem)] = &[
            ("webpack.config.js", BuildSystem::Webpack),
            ("rollup.config.ts", BuildSystem::Rollup),
            ("vite.config.js", BuildSystem::Vite),
            ("build.js", BuildSystem::Esbuild),
            ("pyproject.toml", BuildSystem::Python),
            ("Cargo.toml", BuildSystem::Rust),
            ("go.mod", BuildSystem::Go),
        ];
        for (sentinel, expected) in cases {
            let tmp = tempfile::tempdir().unwrap();
            fs::write(tmp.path().join(sentinel), "").unwrap();
            assert_eq!(BuildSystem::detect(tmp.path()), Some(*expected), "{sentinel}");
        }
    }

    #[test]
    fn no_sentinel_no_build_system() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(BuildSystem::detect(tmp.path()), None);
    }

    #[test]
    fn typescript_output_dirs() {
        assert_eq!(
            BuildSystem::Typescript.output_dirs(),
            &["dist", "build", "lib", "out"]
        );
        assert_eq!(BuildSystem::Rust.output_dirs(), &["target/release"]);
    }
}
