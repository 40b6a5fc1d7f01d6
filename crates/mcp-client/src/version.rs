//! Protocol version catalog.
//!
//! One immutable table describes every wire protocol version the host
//! understands: its capability flags, message format generation, and which
//! older versions it can serve backward-compatibly. Peers are gated by
//! capability rather than by method name, so call sites stay identical
//! across versions.

use serde_json::Value;

use stevedore_domain::error::{Error, Result};

use crate::protocol::{ClientInfo, InitializeParams};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The feature flags a protocol version may enable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub sampling: bool,
    pub roots: bool,
    pub notifications: bool,
    pub progress: bool,
    pub cancellation: bool,
}

impl CapabilitySet {
    /// Names of the enabled flags, for status reporting.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (on, name) in [
            (self.tools, "tools"),
            (self.resources, "resources"),
            (self.prompts, "prompts"),
            (self.sampling, "sampling"),
            (self.roots, "roots"),
            (self.notifications, "notifications"),
            (self.progress, "progress"),
            (self.cancellation, "cancellation"),
        ] {
            if on {
                out.push(name.to_owned());
            }
        }
        out
    }

    /// Whether the method category (prefix before `/`) is enabled.
    ///
    /// Categories outside the capability system (`initialize`, `ping`,
    /// `shutdown`) are always permitted.
    pub fn allows_category(&self, category: &str) -> Option<bool> {
        match category {
            "tools" => Some(self.tools),
            "resources" => Some(self.resources),
            "prompts" => Some(self.prompts),
            "sampling" => Some(self.sampling),
            "notifications" => Some(self.notifications),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Message format generation per envelope category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFormats {
    pub requests: &'static str,
    pub responses: &'static str,
    pub notifications: &'static str,
}

/// Everything the host knows about one protocol version.
#[derive(Debug, Clone)]
pub struct VersionDescriptor {
    pub id: &'static str,
    pub capabilities: CapabilitySet,
    pub message_formats: MessageFormats,
    /// Older version ids this one can serve without translation.
    pub backward_compatible: &'static [&'static str],
    pub deprecated: bool,
}

const FORMATS_V2: MessageFormats = MessageFormats {
    requests: "structured-v2",
    responses: "structured-v2",
    notifications: "structured-v2",
};

const FORMATS_V1: MessageFormats = MessageFormats {
    requests: "legacy-v1",
    responses: "legacy-v1",
    notifications: "legacy-v1",
};

/// Outcome of [`VersionCatalog::negotiate`].
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub version: String,
    pub capabilities: CapabilitySet,
    pub is_backward_compatible: bool,
    pub is_deprecated: bool,
    pub details: String,
}

/// Outcome of [`VersionCatalog::validate_message`].
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable ordered list of supported versions, newest first.
pub struct VersionCatalog {
    versions: Vec<VersionDescriptor>,
}

impl Default for VersionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionCatalog {
    pub fn new() -> Self {
        let all = CapabilitySet {
            tools: true,
            resources: true,
            prompts: true,
            sampling: true,
            roots: true,
            notifications: true,
            progress: true,
            cancellation: true,
        };
        let versions = vec![
            VersionDescriptor {
                id: "2025-06-18",
                capabilities: all,
                message_formats: FORMATS_V2,
                backward_compatible: &["2025-03-26", "2024-11-05"],
                deprecated: false,
            },
            VersionDescriptor {
                id: "2025-03-26",
                capabilities: CapabilitySet {
                    tools: true,
                    resources: true,
                    prompts: true,
                    sampling: true,
                    roots: true,
                    notifications: true,
                    progress: true,
                    cancellation: true,
                },
                message_formats: FORMATS_V2,
                backward_compatible: &["2024-11-05"],
                deprecated: false,
            },
            VersionDescriptor {
                id: "2024-11-05",
                capabilities: CapabilitySet {
                    tools: true,
                    resources: true,
                    prompts: true,
                    sampling: true,
                    roots: false,
                    notifications: true,
                    progress: true,
                    cancellation: true,
                },
                message_formats: FORMATS_V2,
                backward_compatible: &["2024-10-07", "2024-09-24"],
                deprecated: false,
            },
            VersionDescriptor {
                id: "2024-10-07",
                capabilities: CapabilitySet {
                    tools: true,
                    resources: true,
                    prompts: false,
                    sampling: false,
                    roots: false,
                    notifications: true,
                    progress: false,
                    cancellation: false,
                },
                message_formats: FORMATS_V1,
                backward_compatible: &["2024-09-24"],
                deprecated: true,
            },
            VersionDescriptor {
                id: "2024-09-24",
                capabilities: CapabilitySet {
                    tools: true,
                    resources: true,
                    prompts: false,
                    sampling: false,
                    roots: false,
                    notifications: false,
                    progress: false,
                    cancellation: false,
                },
                message_formats: FORMATS_V1,
                // The pre-release draft wire format is close enough to serve.
                backward_compatible: &["2024-06-25"],
                deprecated: true,
            },
        ];
        Self { versions }
    }

    /// Supported version ids, newest first.
    pub fn supported_versions(&self) -> Vec<&'static str> {
        self.versions.iter().map(|v| v.id).collect()
    }

    /// The host's preferred (newest) version.
    pub fn preferred(&self) -> &VersionDescriptor {
        &self.versions[0]
    }

    pub fn descriptor(&self, version: &str) -> Result<&VersionDescriptor> {
        self.versions
            .iter()
            .find(|v| v.id == version)
            .ok_or_else(|| Error::UnknownVersion(version.to_owned()))
    }

    pub fn capabilities_of(&self, version: &str) -> Result<CapabilitySet> {
        Ok(self.descriptor(version)?.capabilities)
    }

    /// Select a mutual version.
    ///
    /// Preference order: exact mutual match starting from the host's newest,
    /// then backward-compatible matches in the same order.
    pub fn negotiate(&self, peer_versions: &[String]) -> Result<Negotiated> {
        for host in &self.versions {
            if peer_versions.iter().any(|p| p == host.id) {
                return Ok(Negotiated {
                    version: host.id.to_owned(),
                    capabilities: host.capabilities,
                    is_backward_compatible: false,
                    is_deprecated: host.deprecated,
                    details: format!("exact match on {}", host.id),
                });
            }
        }
        for host in &self.versions {
            if let Some(older) = host
                .backward_compatible
                .iter()
                .find(|b| peer_versions.iter().any(|p| p == **b))
            {
                return Ok(Negotiated {
                    version: host.id.to_owned(),
                    capabilities: host.capabilities,
                    is_backward_compatible: true,
                    is_deprecated: host.deprecated,
                    details: format!("{} serves peer version {older} backward-compatibly", host.id),
                });
            }
        }
        Err(Error::NoCompatibleVersion(peer_versions.join(", ")))
    }

    /// Enforce JSON-RPC 2.0 shape and per-version capability gating.
    pub fn validate_message(&self, msg: &Value, version: &str) -> Result<ValidationReport> {
        let descriptor = self.descriptor(version)?;
        let mut report = ValidationReport {
            ok: true,
            ..Default::default()
        };

        if msg.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            report.errors.push("jsonrpc field must be \"2.0\"".into());
        }

        let method = msg.get("method").and_then(Value::as_str);
        let has_result = msg.get("result").is_some() || msg.get("error").is_some();
        if method.is_none() && !has_result {
            report
                .errors
                .push("message has neither method nor result/error".into());
        }

        if let Some(method) = method {
            let category = method.split('/').next().unwrap_or(method);
            if let Some(allowed) = descriptor.capabilities.allows_category(category) {
                if !allowed {
                    report.errors.push(format!(
                        "method '{method}' requires the '{category}' capability, \
                         which version {version} does not enable"
                    ));
                }
            }

            if method == "initialize" {
                let declared = msg
                    .get("params")
                    .and_then(|p| p.get("capabilities"))
                    .cloned()
                    .unwrap_or(Value::Null);
                for extra in ["progress", "cancellation"] {
                    let supported = match extra {
                        "progress" => descriptor.capabilities.progress,
                        _ => descriptor.capabilities.cancellation,
                    };
                    if declared.get(extra).is_some() && !supported {
                        report.warnings.push(format!(
                            "initialize declares '{extra}' capability unsupported by {version}"
                        ));
                    }
                }
            }
        }

        report.ok = report.errors.is_empty();
        Ok(report)
    }

    /// Translate a message between versions by composing adjacent
    /// transformers along the ordered list.
    pub fn upgrade_message(&self, msg: &Value, from: &str, to: &str) -> Result<Value> {
        let from_idx = self.index_of(from)?;
        let to_idx = self.index_of(to)?;
        let mut out = msg.clone();

        if from_idx == to_idx {
            return Ok(out);
        }

        // Indices grow toward older versions; step one descriptor at a time.
        let step: i64 = if to_idx > from_idx { 1 } else { -1 };
        let mut idx = from_idx as i64;
        while idx != to_idx as i64 {
            idx += step;
            let target = &self.versions[idx as usize];
            transform_to(&mut out, target);
        }
        Ok(out)
    }

    /// Build `initialize` parameters declaring exactly what the version
    /// enables.
    pub fn build_initialize_params(
        &self,
        version: &str,
        client_info: ClientInfo,
    ) -> Result<InitializeParams> {
        let descriptor = self.descriptor(version)?;
        let caps = descriptor.capabilities;

        let mut capabilities = serde_json::Map::new();
        for (on, name) in [
            (caps.tools, "tools"),
            (caps.resources, "resources"),
            (caps.prompts, "prompts"),
            (caps.sampling, "sampling"),
            (caps.roots, "roots"),
            (caps.progress, "progress"),
            (caps.cancellation, "cancellation"),
        ] {
            if on {
                capabilities.insert(name.to_owned(), serde_json::json!({}));
            }
        }
        if descriptor.message_formats.requests == "legacy-v1" {
            // Legacy peers look for the version list inside capabilities.
            let mut list = vec![Value::String(descriptor.id.to_owned())];
            list.extend(
                descriptor
                    .backward_compatible
                    .iter()
                    .map(|v| Value::String((*v).to_owned())),
            );
            capabilities.insert("protocolVersions".to_owned(), Value::Array(list));
        }

        Ok(InitializeParams {
            protocol_version: descriptor.id.to_owned(),
            capabilities: Value::Object(capabilities),
            client_info,
        })
    }

    fn index_of(&self, version: &str) -> Result<usize> {
        self.versions
            .iter()
            .position(|v| v.id == version)
            .ok_or_else(|| Error::UnknownVersion(version.to_owned()))
    }
}

/// One adjacent-pair transformation: rewrite version markers and strip
/// capability declarations the target version does not know about.
fn transform_to(msg: &mut Value, target: &VersionDescriptor) {
    if let Some(v) = msg.get_mut("protocolVersion") {
        *v = Value::String(target.id.to_owned());
    }
    let legacy = target.message_formats.requests == "legacy-v1";
    if let Some(params) = msg.get_mut("params").and_then(Value::as_object_mut) {
        if let Some(v) = params.get_mut("protocolVersion") {
            *v = Value::String(target.id.to_owned());
        }
        if let Some(caps) = params.get_mut("capabilities").and_then(Value::as_object_mut) {
            let target_caps = target.capabilities;
            for (flag, on) in [
                ("tools", target_caps.tools),
                ("resources", target_caps.resources),
                ("prompts", target_caps.prompts),
                ("sampling", target_caps.sampling),
                ("roots", target_caps.roots),
                ("progress", target_caps.progress),
                ("cancellation", target_caps.cancellation),
            ] {
                if !on {
                    caps.remove(flag);
                }
            }
            if legacy {
                caps.insert(
                    "protocolVersions".to_owned(),
                    Value::Array(vec![Value::String(target.id.to_owned())]),
                );
            } else {
                caps.remove("protocolVersions");
            }
        }
    }
}
