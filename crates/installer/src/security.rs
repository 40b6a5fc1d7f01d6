//! Security gates: source validation before acquisition, tree scanning
//! after build.
//!
//! The source gate is cheap string policy: domain allowlist, publisher
//! trust, URL hygiene. The build scan walks the acquired tree looking for
//! blocked patterns and obfuscation, hashes the well-known entry files,
//! and aggregates findings by severity. High-severity findings block the
//! install unless the caller explicitly allows them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::origin::Origin;

const ALLOWED_DOMAINS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "npmjs.org",
    "pypi.org",
];

const TRUSTED_PUBLISHERS: &[&str] = &[
    "modelcontextprotocol",
    "anthropics",
    "microsoft",
    "openai",
];

const MAX_URL_LENGTH: usize = 500;

/// Directories never scanned.
const SKIP_DIRS: &[&str] = &["node_modules", ".git", ".vscode", "dist", "build"];

/// Extensions of files worth scanning.
const SCAN_EXTENSIONS: &[&str] = &["js", "ts", "py", "sh", "bash", "json", "yaml", "yml"];

/// Entry files whose sha-256 goes into the report.
const CHECKSUM_FILES: &[&str] = &["package.json", "index.js", "server.js", "main.js"];

/// Substring patterns that indicate dangerous behavior, with the severity
/// a match carries.
const BLOCKED_PATTERNS: &[(&str, Severity)] = &[
    ("eval(", Severity::High),
    ("new Function(", Severity::High),
    ("child_process", Severity::High),
    ("execSync", Severity::High),
    ("exec(", Severity::Medium),
    ("spawn(", Severity::Medium),
    ("rm -rf", Severity::High),
    ("sudo ", Severity::High),
    ("chmod 777", Severity::Medium),
    (".ssh/id_rsa", Severity::High),
    (".aws/credentials", Severity::High),
    ("/etc/passwd", Severity::High),
    ("/etc/shadow", Severity::High),
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Report types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Outcome of the pre-acquisition source gate.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub ok: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub risk_level: RiskLevel,
}

/// One issue found in the acquired tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    pub file: String,
}

/// Outcome of the post-build tree scan.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
    pub checksums: BTreeMap<String, String>,
    pub risk_level: RiskLevel,
}

impl ScanReport {
    pub fn has_high_risk(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::High)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate an origin before anything is fetched. Errors are fatal.
pub fn validate_source(url: &str, origin: &Origin) -> SourceReport {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    if url.len() > MAX_URL_LENGTH {
        errors.push(format!("origin exceeds {MAX_URL_LENGTH} characters"));
    }
    if url.contains("..") {
        errors.push("origin contains '..'".into());
    }
    if let Some(bad) = url.chars().find(|c| matches!(c, '<' | '>' | '"' | '|')) {
        errors.push(format!("origin contains forbidden character '{bad}'"));
    }

    match origin {
        Origin::Github { owner, .. }
        | Origin::Gitlab { owner, .. }
        | Origin::Bitbucket { owner, .. } => {
            if !TRUSTED_PUBLISHERS.contains(&owner.to_lowercase().as_str()) {
                warnings.push(format!("publisher '{owner}' is not on the trusted list"));
            }
        }
        Origin::Git { clone_url } => {
            if !domain_allowed(clone_url) {
                errors.push(format!("clone URL domain not in the allowed list: {clone_url}"));
            }
        }
        Origin::Tarball { url } => {
            if !domain_allowed(url) {
                errors.push(format!("tarball domain not in the allowed list: {url}"));
            }
        }
        // Registry packages resolve through npmjs.org / pypi.org; local
        // trees are the operator's own responsibility.
        Origin::Npm { .. } | Origin::Pip { .. } | Origin::Local { .. } => {}
    }

    let risk_level = if !errors.is_empty() {
        RiskLevel::High
    } else if !warnings.is_empty() {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    SourceReport {
        ok: errors.is_empty(),
        warnings,
        errors,
        risk_level,
    }
}

fn domain_allowed(url: &str) -> bool {
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("");
    ALLOWED_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Build scan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recursively scan the acquired tree.
pub fn scan_tree(root: &Path) -> std::io::Result<ScanReport> {
    let mut report = ScanReport::default();
    scan_dir(root, root, &mut report)?;
    scan_package_json(root, &mut report);
    compute_checksums(root, &mut report);

    report.risk_level = if report.has_high_risk() {
        RiskLevel::High
    } else if !report.findings.is_empty() {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    Ok(report)
}

fn scan_dir(root: &Path, dir: &Path, report: &mut ScanReport) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            scan_dir(root, &path, report)?;
            continue;
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if SCAN_EXTENSIONS.contains(&ext) => {}
            _ => continue,
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => continue, // binary or unreadable: skip
        };
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();

        scan_content(&content, &rel, report);
    }
    Ok(())
}

fn scan_content(content: &str, file: &str, report: &mut ScanReport) {
    for (pattern, severity) in BLOCKED_PATTERNS {
        if content.contains(pattern) {
            report.findings.push(Finding {
                severity: *severity,
                message: format!("blocked pattern '{pattern}'"),
                file: file.to_owned(),
            });
        }
    }

    // Obfuscation heuristic over the first 50 lines: very long lines with
    // almost no whitespace, or lines dominated by special characters.
    let mut suspicious = 0usize;
    for line in content.lines().take(50) {
        let long_and_dense = line.len() > 200 && line.split_whitespace().count() < 5;
        let special = line
            .chars()
            .filter(|c| !c.is_ascii_alphanumeric() && !c.is_ascii_whitespace())
            .count();
        let special_heavy = !line.is_empty() && special * 100 / line.len() > 30 && line.len() > 40;
        if long_and_dense || special_heavy {
            suspicious += 1;
        }
    }
    if suspicious > 3 {
        report.findings.push(Finding {
            severity: Severity::Medium,
            message: format!("possible obfuscation ({suspicious} suspicious lines)"),
            file: file.to_owned(),
        });
    }
}

/// Check `package.json` scripts against the pattern set and flag
/// path-shaped dependency names.
fn scan_package_json(root: &Path, report: &mut ScanReport) {
    let raw = match std::fs::read_to_string(root.join("package.json")) {
        Ok(raw) => raw,
        Err(_) => return,
    };
    let pkg: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(pkg) => pkg,
        Err(_) => return,
    };

    if let Some(scripts) = pkg.get("scripts").and_then(|s| s.as_object()) {
        for (name, value) in scripts {
            let script = value.as_str().unwrap_or("");
            for (pattern, severity) in BLOCKED_PATTERNS {
                if script.contains(pattern) {
                    report.findings.push(Finding {
                        severity: *severity,
                        message: format!("script '{name}' contains blocked pattern '{pattern}'"),
                        file: "package.json".into(),
                    });
                }
            }
        }
    }

    for key in ["dependencies", "devDependencies"] {
        if let Some(deps) = pkg.get(key).and_then(|d| d.as_object()) {
            for name in deps.keys() {
                if name.contains("..") {
                    report.findings.push(Finding {
                        severity: Severity::Medium,
                        message: format!("dependency name '{name}' contains '..'"),
                        file: "package.json".into(),
                    });
                } else if name.contains('/') && !name.starts_with('@') {
                    report.findings.push(Finding {
                        severity: Severity::Low,
                        message: format!("dependency name '{name}' looks like a path"),
                        file: "package.json".into(),
                    });
                }
            }
        }
    }
}

fn compute_checksums(root: &Path, report: &mut ScanReport) {
    for name in CHECKSUM_FILES {
        let path = root.join(name);
        if let Ok(bytes) = std::fs::read(&path) {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            report
                .checksums
                .insert((*name).to_owned(), format!("{:x}", hasher.finalize()));
        }
    }
}
