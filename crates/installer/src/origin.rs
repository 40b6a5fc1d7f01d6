//! Install origin classification.
//!
//! One entry point turns a textual origin into a typed [`Origin`]. The
//! classification drives the acquisition strategy; precedence follows the
//! order of the match arms in [`Origin::parse`]. Any bare token that
//! matches nothing else is treated as an npm package.

use serde::{Deserialize, Serialize};

/// A classified install origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Origin {
    Github {
        owner: String,
        repo: String,
        branch: String,
        subpath: Option<String>,
    },
    Gitlab {
        owner: String,
        repo: String,
        branch: String,
        subpath: Option<String>,
    },
    Bitbucket {
        owner: String,
        repo: String,
        branch: String,
        subpath: Option<String>,
    },
    Git {
        clone_url: String,
    },
    Npm {
        package: String,
        version: String,
    },
    Pip {
        package: String,
        version: String,
    },
    Tarball {
        url: String,
    },
    Local {
        path: String,
    },
}

impl Origin {
    /// Classify a textual origin. Never fails: the fallback class is npm.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();

        if let Some(HostedGit {
            owner,
            repo,
            branch,
            subpath,
        }) = parse_hosted_git(input, "github.com", "/tree/")
        {
            return Self::Github {
                owner,
                repo,
                branch,
                subpath,
            };
        }
        if let Some(HostedGit {
            owner,
            repo,
            branch,
            subpath,
        }) = parse_hosted_git(input, "gitlab.com", "/-/tree/")
        {
            return Self::Gitlab {
                owner,
                repo,
                branch,
                subpath,
            };
        }
        if let Some(HostedGit {
            owner,
            repo,
            branch,
            subpath,
        }) = parse_hosted_git(input, "bitbucket.org", "/src/")
        {
            return Self::Bitbucket {
                owner,
                repo,
                branch,
                subpath,
            };
        }

        if let Some(rest) = input.strip_prefix("git+") {
            if (rest.starts_with("http://") || rest.starts_with("https://"))
                && rest.ends_with(".git")
            {
                return Self::Git {
                    clone_url: rest.to_owned(),
                };
            }
        }

        if is_tarball_url(input) {
            return Self::Tarball {
                url: input.to_owned(),
            };
        }

        if let Some(path) = input.strip_prefix("file://") {
            return Self::Local {
                path: path.to_owned(),
            };
        }

        if let Some(rest) = input.strip_prefix("pip:").or_else(|| input.strip_prefix("pypi:")) {
            return parse_pip(rest);
        }
        if input.contains("==") && !input.contains('/') && !input.contains(':') {
            return parse_pip(input);
        }

        if let Some(rest) = input.strip_prefix("npm:") {
            return parse_npm(rest);
        }
        parse_npm(input)
    }

    /// Directory class under the install root (`<type>/<name>`).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Github { .. } => "github",
            Self::Gitlab { .. } => "gitlab",
            Self::Bitbucket { .. } => "bitbucket",
            Self::Git { .. } => "git",
            Self::Npm { .. } => "npm",
            Self::Pip { .. } => "pip",
            Self::Tarball { .. } => "tarball",
            Self::Local { .. } => "local",
        }
    }

    /// The origin's qualified name (owner/repo, package, or last path
    /// segment), used for the install directory and cache key.
    pub fn full_name(&self) -> String {
        match self {
            Self::Github { owner, repo, .. }
            | Self::Gitlab { owner, repo, .. }
            | Self::Bitbucket { owner, repo, .. } => format!("{owner}/{repo}"),
            Self::Git { clone_url } => clone_url
                .rsplit('/')
                .next()
                .unwrap_or(clone_url)
                .trim_end_matches(".git")
                .to_owned(),
            Self::Npm { package, .. } => package.clone(),
            Self::Pip { package, .. } => package.clone(),
            Self::Tarball { url } => url
                .rsplit('/')
                .next()
                .unwrap_or(url)
                .split('.')
                .next()
                .unwrap_or("tarball")
                .to_owned(),
            Self::Local { path } => path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("local")
                .to_owned(),
        }
    }

    /// The version component of the cache key.
    pub fn version(&self) -> String {
        match self {
            Self::Npm { version, .. } | Self::Pip { version, .. } => version.clone(),
            Self::Github { branch, .. }
            | Self::Gitlab { branch, .. }
            | Self::Bitbucket { branch, .. } => branch.clone(),
            _ => "latest".to_owned(),
        }
    }

    /// Filesystem-safe directory name for this origin.
    pub fn dir_name(&self) -> String {
        self.full_name()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// The clone URL for git-family origins.
    pub fn clone_url(&self) -> Option<String> {
        match self {
            Self::Github { owner, repo, .. } => {
                Some(format!("https://github.com/{owner}/{repo}.git"))
            }
            Self::Gitlab { owner, repo, .. } => {
                Some(format!("https://gitlab.com/{owner}/{repo}.git"))
            }
            Self::Bitbucket { owner, repo, .. } => {
                Some(format!("https://bitbucket.org/{owner}/{repo}.git"))
            }
            Self::Git { clone_url } => Some(clone_url.clone()),
            _ => None,
        }
    }
}

struct HostedGit {
    owner: String,
    repo: String,
    branch: String,
    subpath: Option<String>,
}

/// `https://<host>/{owner}/{repo}[<tree_marker>{branch}][/{path}]`
fn parse_hosted_git(input: &str, host: &str, tree_marker: &str) -> Option<HostedGit> {
    let rest = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))?;
    let rest = rest.strip_prefix(host)?.strip_prefix('/')?;

    let (repo_part, tree_part) = match rest.find(tree_marker) {
        Some(idx) => (&rest[..idx], Some(&rest[idx + tree_marker.len()..])),
        None => (rest, None),
    };

    let mut segments = repo_part.split('/').filter(|s| !s.is_empty());
    let owner = segments.next()?.to_owned();
    let repo = segments.next()?.trim_end_matches(".git").to_owned();
    if segments.next().is_some() {
        // Extra path segments without a tree marker: not a repo URL shape
        // we recognize.
        return None;
    }

    let (branch, subpath) = match tree_part {
        Some(tree) => {
            let mut parts = tree.splitn(2, '/');
            let branch = parts.next().unwrap_or("main");
            let subpath = parts
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_owned);
            (
                if branch.is_empty() { "main" } else { branch }.to_owned(),
                subpath,
            )
        }
        None => ("main".to_owned(), None),
    };

    Some(HostedGit {
        owner,
        repo,
        branch,
        subpath,
    })
}

fn is_tarball_url(input: &str) -> bool {
    (input.starts_with("http://") || input.starts_with("https://"))
        && (input.ends_with(".tar.gz") || input.ends_with(".tgz") || input.ends_with(".zip"))
}

/// `[@scope/]name[@version]`, default version `latest`.
fn parse_npm(input: &str) -> Origin {
    let (package, version) = if let Some(rest) = input.strip_prefix('@') {
        // Scoped: the version separator is the second '@'.
        match rest.find('@') {
            Some(idx) => (format!("@{}", &rest[..idx]), rest[idx + 1..].to_owned()),
            None => (format!("@{rest}"), "latest".to_owned()),
        }
    } else {
        match input.find('@') {
            Some(idx) => (input[..idx].to_owned(), input[idx + 1..].to_owned()),
            None => (input.to_owned(), "latest".to_owned()),
        }
    };
    Origin::Npm { package, version }
}

/// `name[==version]`, default version `latest`.
fn parse_pip(input: &str) -> Origin {
    match input.split_once("==") {
        Some((name, version)) => Origin::Pip {
            package: name.to_owned(),
            version: version.to_owned(),
        },
        None => Origin::Pip {
            package: input.to_owned(),
            version: "latest".to_owned(),
        },
    }
}
