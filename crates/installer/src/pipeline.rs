//! The install pipeline: origin → security gate → acquisition → analysis
//! → dependencies → build → validation → scan → invocation → cache.
//!
//! Every stage emits a progress event; any fatal stage failure re-enters
//! the pipeline from the top while the retry budget lasts. A cache hit
//! short-circuits everything.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use stevedore_domain::config::InstallerConfig;
use stevedore_domain::error::{Error, Result};
use stevedore_domain::event::HostEvent;
use stevedore_domain::record::{InstallMethod, ServerRecord};

use crate::acquire::acquire;
use crate::analyze::analyze;
use crate::build::{install_dependencies, run_build, validate_output};
use crate::cache::{options_fingerprint, CacheEntry, MetadataCache};
use crate::command::CommandRunner;
use crate::derive::derive_invocation;
use crate::origin::Origin;
use crate::security::{scan_tree, validate_source};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options & outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Explicit server id; derived from the origin when absent.
    pub id: Option<String>,
    pub force_reinstall: bool,
    pub allow_high_risk: bool,
    pub auto_start: bool,
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub record: ServerRecord,
    pub from_cache: bool,
    pub install_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Installer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Installer {
    install_root: PathBuf,
    config: InstallerConfig,
    cache: MetadataCache,
    runner: Arc<dyn CommandRunner>,
    http: reqwest::Client,
    events: broadcast::Sender<HostEvent>,
}

impl Installer {
    pub fn new(
        install_root: PathBuf,
        config: InstallerConfig,
        runner: Arc<dyn CommandRunner>,
        events: broadcast::Sender<HostEvent>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::install(format!("building HTTP client: {e}")))?;
        let cache = MetadataCache::new(
            install_root.join(".cache").join("metadata"),
            config.cache_ttl_days,
        );
        // `.cache/builds/` is part of the on-disk layout, reserved for
        // incremental build reuse.
        std::fs::create_dir_all(install_root.join(".cache").join("builds"))?;
        Ok(Self {
            install_root,
            config,
            cache,
            runner,
            http,
            events,
        })
    }

    /// Install from a textual origin, retrying per config.
    pub async fn install(&self, url: &str, options: &InstallOptions) -> Result<InstallOutcome> {
        let install_id = uuid::Uuid::new_v4().to_string();
        self.emit(HostEvent::InstallStarted {
            url: url.to_owned(),
            install_id: install_id.clone(),
        });

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.run_pipeline(url, options, &install_id).await {
                Ok(outcome) => {
                    self.emit(HostEvent::InstallCompleted {
                        install_id: install_id.clone(),
                        server_id: outcome.record.id.clone(),
                        from_cache: outcome.from_cache,
                    });
                    return Ok(outcome);
                }
                Err(e) => {
                    let retryable = !matches!(e, Error::SecurityBlocked(_));
                    if retryable && self.config.auto_retry && attempt < self.config.max_retries {
                        tracing::warn!(url, attempt, error = %e, "install failed, retrying");
                        self.progress(&install_id, "retry", &format!("attempt {attempt} failed: {e}"));
                        continue;
                    }
                    self.emit(HostEvent::InstallFailed {
                        install_id: install_id.clone(),
                        url: url.to_owned(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        url: &str,
        options: &InstallOptions,
        install_id: &str,
    ) -> Result<InstallOutcome> {
        let origin = Origin::parse(url);
        let cache_key = MetadataCache::key(&origin, &options_fingerprint(options.allow_high_risk));

        // 1. Cache check.
        if !options.force_reinstall {
            if let Some(entry) = self.cache.load(&cache_key) {
                tracing::info!(url, cache_key, "install served from cache");
                return Ok(InstallOutcome {
                    record: entry.server_config,
                    from_cache: true,
                    install_id: install_id.to_owned(),
                });
            }
        }

        // 2. Source gate. Errors are fatal and never retried.
        let source_report = validate_source(url, &origin);
        for warning in &source_report.warnings {
            tracing::warn!(url, warning = %warning, "source validation warning");
        }
        if !source_report.ok {
            return Err(Error::SecurityBlocked(source_report.errors.join("; ")));
        }

        // 3. Acquisition.
        self.progress(install_id, "clone", url);
        let source_dir = self
            .install_root
            .join(origin.type_name())
            .join(origin.dir_name());
        acquire(
            &origin,
            url,
            &source_dir,
            self.runner.as_ref(),
            &self.http,
            Duration::from_millis(self.config.command_timeout_ms),
        )
        .await?;

        // 4. Analysis.
        let analysis = analyze(&source_dir);
        self.progress(
            install_id,
            "analyze",
            &format!(
                "node={} python={} buildSystem={:?}",
                analysis.is_node(),
                analysis.python,
                analysis.build_system
            ),
        );

        // 5. Dependencies.
        if analysis.is_node() || analysis.python {
            self.progress(install_id, "dependencies", "installing dependencies");
            install_dependencies(
                &source_dir,
                &analysis,
                self.runner.as_ref(),
                Duration::from_millis(self.config.command_timeout_ms),
            )
            .await?;
        }

        // 6. Build.
        let output_dir = match analysis.build_system {
            Some(system) => {
                self.progress(install_id, "build", &format!("{system:?}"));
                run_build(
                    &source_dir,
                    system,
                    self.runner.as_ref(),
                    Duration::from_millis(self.config.build_timeout_ms),
                )
                .await?
            }
            None => None,
        };

        // 7. Build validation.
        if let Some(output) = &output_dir {
            self.progress(install_id, "validate", &output.to_string_lossy());
            for warning in validate_output(output, analysis.is_node())? {
                tracing::warn!(url, warning = %warning, "build validation warning");
            }
        }

        // 8. Security scan of the acquired tree.
        self.progress(install_id, "security", "scanning source tree");
        let scan = scan_tree(&source_dir)?;
        if scan.has_high_risk() && !options.allow_high_risk {
            return Err(Error::SecurityBlocked(format!(
                "{} high-risk finding(s); pass allow_high_risk to override",
                scan.findings
                    .iter()
                    .filter(|f| f.severity == crate::security::Severity::High)
                    .count()
            )));
        }

        // 9. Invocation derivation and record assembly.
        let invocation =
            derive_invocation(&source_dir, &analysis, output_dir.as_deref(), &origin);
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| origin.dir_name().replace('.', "-"));
        let mut record = ServerRecord::new(&id, origin.full_name(), invocation);
        record.install_method = InstallMethod::Enhanced;
        record.install_url = Some(url.to_owned());
        record.version = Some(origin.version()).filter(|v| v.as_str() != "latest");
        record.metadata.install_path = Some(source_dir.clone());
        record.metadata.install_id = Some(install_id.to_owned());
        record.metadata.auto_start = options.auto_start;
        record.metadata.security = Some(serde_json::json!({
            "riskLevel": scan.risk_level,
            "findings": scan.findings,
            "checksums": scan.checksums,
        }));
        record.validate()?;

        // 10. Cache write.
        self.progress(install_id, "cache", &cache_key);
        self.cache.store(&CacheEntry {
            timestamp: Utc::now(),
            cache_key: cache_key.clone(),
            server_config: record.clone(),
            install_path: source_dir,
        })?;

        Ok(InstallOutcome {
            record,
            from_cache: false,
            install_id: install_id.to_owned(),
        })
    }

    /// Remove a server's source tree from disk.
    pub fn remove_files(&self, record: &ServerRecord) -> Result<()> {
        if let Some(path) = &record.metadata.install_path {
            // Only ever delete inside our own root.
            if path.starts_with(&self.install_root) && path.exists() {
                std::fs::remove_dir_all(path)?;
                tracing::info!(server_id = %record.id, path = %path.display(), "removed install tree");
            }
        }
        if let Some(url) = &record.install_url {
            let origin = Origin::parse(url);
            self.cache
                .invalidate(&MetadataCache::key(&origin, &options_fingerprint(false)));
            self.cache
                .invalidate(&MetadataCache::key(&origin, &options_fingerprint(true)));
        }
        Ok(())
    }

    pub fn clear_cache(&self) -> Result<usize> {
        self.cache.clear()
    }

    fn progress(&self, install_id: &str, stage: &str, detail: &str) {
        tracing::info!(install_id, stage, detail, "install progress");
        self.emit(HostEvent::InstallProgress {
            install_id: install_id.to_owned(),
            stage: stage.to_owned(),
            detail: detail.to_owned(),
        });
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}
