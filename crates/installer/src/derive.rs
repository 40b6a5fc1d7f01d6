//! Invocation derivation: from an installed tree to something runnable.
//!
//! The ladder, in order: a built entry under the output directory, the
//! package's own `bin`, its `start` script, `npx -y` for scoped registry
//! packages, any conventional entry point in the tree, and finally
//! `node index.js`.

use std::path::Path;

use stevedore_domain::record::Invocation;

use crate::analyze::ProjectAnalysis;
use crate::origin::Origin;

const OUTPUT_ENTRY_FILES: &[&str] = &["index.js", "main.js", "server.js", "app.js"];
const ENTRY_BASENAMES: &[&str] = &["index", "server", "main", "app"];
const ENTRY_DIRS: &[&str] = &["", "src/", "dist/", "build/", "lib/"];

pub fn derive_invocation(
    source_dir: &Path,
    analysis: &ProjectAnalysis,
    output_dir: Option<&Path>,
    origin: &Origin,
) -> Invocation {
    // 1. A standard entry under the build output.
    if let Some(output) = output_dir {
        for name in OUTPUT_ENTRY_FILES {
            let candidate = output.join(name);
            if candidate.is_file() {
                let rel = candidate
                    .strip_prefix(source_dir)
                    .unwrap_or(&candidate)
                    .to_string_lossy()
                    .into_owned();
                return Invocation::new("node").with_args([rel]).with_cwd(source_dir);
            }
        }
    }

    // 2. Node package metadata.
    if let Some(node) = &analysis.node {
        if let Some(bin) = node.bin_names.first() {
            return Invocation::new("npx")
                .with_args([bin.clone()])
                .with_cwd(source_dir);
        }
        if node.scripts.contains_key("start") {
            return Invocation::new("npm")
                .with_args(["start"])
                .with_cwd(source_dir);
        }
    }
    if let Origin::Npm { package, .. } = origin {
        if package.starts_with('@') && package.contains('/') {
            // Scoped packages run straight off the registry; cwd stays the
            // host's own working directory.
            return Invocation::new("npx").with_args(["-y".to_owned(), package.clone()]);
        }
    }

    // 3. Conventional entry points anywhere we expect them.
    for dir in ENTRY_DIRS {
        for base in ENTRY_BASENAMES {
            for ext in ["js", "ts"] {
                let rel = format!("{dir}{base}.{ext}");
                if source_dir.join(&rel).is_file() {
                    let command = if ext == "ts" { "ts-node" } else { "node" };
                    return Invocation::new(command).with_args([rel]).with_cwd(source_dir);
                }
            }
        }
    }

    // 4. Last resort.
    Invocation::new("node")
        .with_args(["index.js"])
        .with_cwd(source_dir)
}
