//! Source acquisition: turn a classified origin into a populated source
//! tree under the install root.
//!
//! Any previous directory at the destination is removed first; a partial
//! acquisition never survives next to a complete one. Archive extraction
//! is hardened against traversal, links, and oversized entries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use stevedore_domain::error::{Error, Result};

use crate::command::{run_checked, CommandRunner, CommandSpec};
use crate::origin::Origin;

/// Max single extracted file (10 MB).
const MAX_SINGLE_FILE_BYTES: u64 = 10 * 1024 * 1024;
/// Max total extracted size (200 MB).
const MAX_TOTAL_EXTRACT_BYTES: u64 = 200 * 1024 * 1024;
/// Max number of archive entries.
const MAX_FILE_COUNT: usize = 20_000;

/// Fetch `origin` into `dest`.
pub async fn acquire(
    origin: &Origin,
    url: &str,
    dest: &Path,
    runner: &dyn CommandRunner,
    http: &reqwest::Client,
    command_timeout: Duration,
) -> Result<()> {
    reset_dir(dest)?;

    match origin {
        Origin::Github { branch, subpath, .. }
        | Origin::Gitlab { branch, subpath, .. }
        | Origin::Bitbucket { branch, subpath, .. } => {
            let clone_url = origin
                .clone_url()
                .ok_or_else(|| Error::install("git origin without a clone URL"))?;
            git_clone(&clone_url, Some(branch), subpath.as_deref(), dest, runner, command_timeout)
                .await
        }
        Origin::Git { clone_url } => {
            git_clone(clone_url, None, None, dest, runner, command_timeout).await
        }
        Origin::Npm { package, version } => {
            npm_pack(package, version, dest, runner, command_timeout).await
        }
        Origin::Pip { package, version } => {
            pip_download(package, version, dest, runner, command_timeout).await
        }
        Origin::Tarball { url: tar_url } => {
            download_archive(tar_url, dest, runner, http, command_timeout).await
        }
        Origin::Local { path } => {
            let source = PathBuf::from(path);
            if !source.is_dir() {
                return Err(Error::install(format!(
                    "local path is not a directory: {path}"
                )));
            }
            copy_dir_recursive(&source, dest).map_err(Error::Io)
        }
    }
    .map_err(|e| {
        // Leave no partial tree behind.
        let _ = std::fs::remove_dir_all(dest);
        tracing::warn!(url, error = %e, "acquisition failed");
        e
    })
}

fn reset_dir(dest: &Path) -> Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;
    Ok(())
}

// ── git family ──────────────────────────────────────────────────────

async fn git_clone(
    clone_url: &str,
    branch: Option<&str>,
    subpath: Option<&str>,
    dest: &Path,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<()> {
    let mut spec = CommandSpec::new("git").args(["clone", "--depth", "1"]);
    if let Some(branch) = branch {
        spec = spec.args(["--branch", branch]);
    }
    spec = spec
        .args([clone_url.to_owned(), dest.to_string_lossy().into_owned()])
        .timeout(timeout);
    run_checked(runner, &spec).await?;

    if let Some(subpath) = subpath {
        hoist_subtree(dest, subpath)?;
    }
    Ok(())
}

/// Replace `dest` with `dest/<subpath>`.
fn hoist_subtree(dest: &Path, subpath: &str) -> Result<()> {
    if subpath.contains("..") {
        return Err(Error::install(format!("subpath contains '..': {subpath}")));
    }
    let subtree = dest.join(subpath);
    if !subtree.is_dir() {
        return Err(Error::install(format!(
            "subpath '{subpath}' does not exist in the cloned tree"
        )));
    }
    let staging = staging_path(dest);
    std::fs::rename(&subtree, &staging)?;
    std::fs::remove_dir_all(dest)?;
    std::fs::rename(&staging, dest)?;
    Ok(())
}

// ── npm ─────────────────────────────────────────────────────────────

async fn npm_pack(
    package: &str,
    version: &str,
    dest: &Path,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<()> {
    let staging = staging_path(dest);
    std::fs::create_dir_all(&staging)?;

    let spec = CommandSpec::new("npm")
        .args(["pack".to_owned(), format!("{package}@{version}")])
        .cwd(&staging)
        .timeout(timeout);
    let result = run_checked(runner, &spec).await;
    if let Err(e) = result {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let tgz = std::fs::read_dir(&staging)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().map_or(false, |ext| ext == "tgz"))
        .ok_or_else(|| Error::install(format!("npm pack produced no tarball for {package}")))?;

    let bytes = std::fs::read(&tgz)?;
    let extract_dir = staging.join("extract");
    std::fs::create_dir_all(&extract_dir)?;
    safe_untar(&bytes, &extract_dir)?;

    // npm tarballs wrap everything in `package/`.
    let package_dir = extract_dir.join("package");
    let source = if package_dir.is_dir() {
        package_dir
    } else {
        extract_dir
    };
    copy_dir_recursive(&source, dest)?;
    std::fs::remove_dir_all(&staging)?;
    Ok(())
}

// ── pip ─────────────────────────────────────────────────────────────

async fn pip_download(
    package: &str,
    version: &str,
    dest: &Path,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<()> {
    let requirement = if version == "latest" {
        package.to_owned()
    } else {
        format!("{package}=={version}")
    };
    let spec = CommandSpec::new("pip")
        .args([
            "download".to_owned(),
            "--no-deps".to_owned(),
            "--src".to_owned(),
            dest.to_string_lossy().into_owned(),
            requirement,
        ])
        .cwd(dest)
        .timeout(timeout);
    run_checked(runner, &spec).await?;
    Ok(())
}

// ── tarball ─────────────────────────────────────────────────────────

async fn download_archive(
    url: &str,
    dest: &Path,
    runner: &dyn CommandRunner,
    http: &reqwest::Client,
    timeout: Duration,
) -> Result<()> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::install(format!("download {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::install(format!(
            "download {url}: HTTP {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::install(format!("download {url}: {e}")))?;

    let staging = staging_path(dest);
    std::fs::create_dir_all(&staging)?;
    let archive = staging.join(if url.ends_with(".zip") {
        "archive.zip"
    } else {
        "archive.tar.gz"
    });
    std::fs::write(&archive, &bytes)?;

    let result = if url.ends_with(".zip") {
        run_checked(
            runner,
            &CommandSpec::new("unzip")
                .args([
                    "-q".to_owned(),
                    archive.to_string_lossy().into_owned(),
                    "-d".to_owned(),
                    dest.to_string_lossy().into_owned(),
                ])
                .timeout(timeout),
        )
        .await
    } else {
        run_checked(
            runner,
            &CommandSpec::new("tar")
                .args([
                    "-xzf".to_owned(),
                    archive.to_string_lossy().into_owned(),
                    "-C".to_owned(),
                    dest.to_string_lossy().into_owned(),
                    "--strip-components=1".to_owned(),
                ])
                .timeout(timeout),
        )
        .await
    };
    let _ = std::fs::remove_dir_all(&staging);
    result.map(|_| ())
}

// ── shared helpers ──────────────────────────────────────────────────

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "staging".to_owned());
    name.push_str(".staging");
    dest.with_file_name(name)
}

/// Extract a gzipped tarball, rejecting traversal, absolute paths, links,
/// and oversized content.
pub fn safe_untar(tarball_bytes: &[u8], dest_dir: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(tarball_bytes);
    let mut archive = tar::Archive::new(decoder);

    let mut total_bytes: u64 = 0;
    let mut file_count: usize = 0;

    let entries = archive
        .entries()
        .map_err(|e| Error::install(format!("failed to read tar entries: {e}")))?;

    for entry_result in entries {
        let mut entry =
            entry_result.map_err(|e| Error::install(format!("bad tar entry: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::install(format!("bad tar entry path: {e}")))?
            .to_path_buf();

        if entry_path.is_absolute() {
            return Err(Error::install(format!(
                "tar contains absolute path: {}",
                entry_path.display()
            )));
        }
        for component in entry_path.components() {
            if matches!(component, std::path::Component::ParentDir) {
                return Err(Error::install(format!(
                    "tar contains path traversal: {}",
                    entry_path.display()
                )));
            }
        }

        let entry_type = entry.header().entry_type();
        if entry_type == tar::EntryType::Symlink || entry_type == tar::EntryType::Link {
            return Err(Error::install(format!(
                "tar contains symlink/hardlink: {}",
                entry_path.display()
            )));
        }

        let size = entry.size();
        if size > MAX_SINGLE_FILE_BYTES {
            return Err(Error::install(format!(
                "tar entry {} is {size} bytes (max {MAX_SINGLE_FILE_BYTES})",
                entry_path.display()
            )));
        }
        total_bytes += size;
        if total_bytes > MAX_TOTAL_EXTRACT_BYTES {
            return Err(Error::install(format!(
                "tar total extraction exceeds {MAX_TOTAL_EXTRACT_BYTES} bytes"
            )));
        }
        file_count += 1;
        if file_count > MAX_FILE_COUNT {
            return Err(Error::install(format!(
                "tar contains more than {MAX_FILE_COUNT} files"
            )));
        }

        let full_path = dest_dir.join(&entry_path);
        if entry_type == tar::EntryType::Directory {
            std::fs::create_dir_all(&full_path)?;
        } else if entry_type == tar::EntryType::Regular || entry_type == tar::EntryType::GNUSparse {
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&full_path)?;
            std::io::copy(&mut entry, &mut file)?;
        }
        // Other entry types (devices etc.) are skipped.
    }
    Ok(())
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let entry_path = entry.path();
        let dest_path = dst.join(entry.file_name());
        if entry_path.is_dir() {
            copy_dir_recursive(&entry_path, &dest_path)?;
        } else {
            std::fs::copy(&entry_path, &dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::FakeRunner;
    use std::fs;

    fn tgz_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        for (path, bytes) in entries {
            let mut header = tar::Header::new_gnu();
            header.as_old_mut().name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *bytes).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn safe_untar_extracts_regular_files() {
        let tmp = tempfile::tempdir().unwrap();
        let tgz = tgz_with(&[("package/index.js", b"hello"), ("package/sub/a.js", b"a")]);
        safe_untar(&tgz, tmp.path()).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("package/index.js")).unwrap(),
            "hello"
        );
        assert!(tmp.path().join("package/sub/a.js").exists());
    }

    #[test]
    fn safe_untar_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let tgz = tgz_with(&[("../escape.js", b"x")]);
        let err = safe_untar(&tgz, tmp.path()).unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn copy_dir_recursive_copies_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("nested/b.txt"), "b").unwrap();

        let dst = tmp.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt")).unwrap(), "b");
    }

    #[tokio::test]
    async fn local_acquire_copies_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("index.js"), "x").unwrap();

        let dest = tmp.path().join("dest");
        let origin = Origin::Local {
            path: source.to_string_lossy().into_owned(),
        };
        let runner = FakeRunner::new();
        let http = reqwest::Client::new();
        acquire(
            &origin,
            "file://source",
            &dest,
            &runner,
            &http,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(dest.join("index.js").exists());
    }

    #[tokio::test]
    async fn acquire_replaces_previous_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("new.js"), "x").unwrap();

        let dest = tmp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.js"), "old").unwrap();

        let origin = Origin::Local {
            path: source.to_string_lossy().into_owned(),
        };
        let runner = FakeRunner::new();
        let http = reqwest::Client::new();
        acquire(
            &origin,
            "file://source",
            &dest,
            &runner,
            &http,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(dest.join("new.js").exists());
        assert!(!dest.join("stale.js").exists());
    }

    #[tokio::test]
    async fn git_clone_failure_cleans_dest() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");
        let origin = Origin::parse("https://github.com/a/b");
        let runner = FakeRunner::new().fail("git", 128);
        let http = reqwest::Client::new();
        let err = acquire(
            &origin,
            "https://github.com/a/b",
            &dest,
            &runner,
            &http,
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("git"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn clone_passes_branch_and_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");
        let origin = Origin::parse("https://github.com/a/b/tree/dev");
        let runner = FakeRunner::new().ok("git");
        let http = reqwest::Client::new();
        acquire(
            &origin,
            "https://github.com/a/b/tree/dev",
            &dest,
            &runner,
            &http,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        let log = runner.call_log();
        assert!(log[0].contains("clone --depth 1 --branch dev"));
        assert!(log[0].contains("https://github.com/a/b.git"));
    }
}
