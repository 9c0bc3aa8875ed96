//! Capability registry and resolver.
//!
//! Providers register capabilities at startup: a capability name routed to a
//! command, tagged with the provider (and optionally a target) that serves
//! it. Several providers may serve the same capability name.
//!
//! Resolution of an intent walks its capability names in order and, for each
//! name, picks the first non-empty source:
//!
//! 1. user mappings (they win outright; the registry is not consulted)
//! 2. registered capabilities
//! 3. a synthesized fallback routing the name to a same-named command
//!
//! In steps 1 and 2, if the intent names a provider/target and at least one
//! candidate honors it, only exact matches are returned.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use flowline_config::MappingConfig;

use crate::intent::Intent;

/// Rewrites an intent into the payload a handler expects.
pub type PayloadMapper = Arc<dyn Fn(&Intent) -> Value + Send + Sync>;

/// Where a command executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    /// In-process command.
    #[default]
    #[serde(alias = "vscode")]
    Internal,
    /// Handled by an external program.
    External,
}

/// Whether a capability can run unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Determinism {
    Deterministic,
    Interactive,
}

/// A registered capability.
#[derive(Clone)]
pub struct Capability {
    pub capability: String,
    pub command: String,
    pub provider: Option<String>,
    pub target: Option<String>,
    pub kind: CapabilityType,
    pub map_payload: Option<PayloadMapper>,
    pub determinism: Option<Determinism>,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("capability", &self.capability)
            .field("command", &self.command)
            .field("provider", &self.provider)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("map_payload", &self.map_payload.is_some())
            .field("determinism", &self.determinism)
            .finish()
    }
}

/// A user override. Always takes precedence over registry entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMapping {
    pub capability: String,
    pub command: String,
    pub provider: Option<String>,
    pub target: Option<String>,
    pub kind: CapabilityType,
}

impl From<&MappingConfig> for UserMapping {
    fn from(cfg: &MappingConfig) -> Self {
        let kind = match cfg.kind.as_deref() {
            Some("external") => CapabilityType::External,
            _ => CapabilityType::Internal,
        };
        Self {
            capability: cfg.capability.clone(),
            command: cfg.command.clone(),
            provider: cfg.provider.clone(),
            target: cfg.target.clone(),
            kind,
        }
    }
}

/// Which source a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    User,
    Registry,
    Fallback,
}

/// One concrete handler an intent's capability name resolved to.
#[derive(Clone)]
pub struct Resolution {
    pub capability: String,
    pub command: String,
    pub provider: Option<String>,
    pub target: Option<String>,
    pub kind: CapabilityType,
    pub map_payload: Option<PayloadMapper>,
    pub source: ResolutionSource,
}

impl Resolution {
    /// The payload to hand to this resolution's command.
    pub fn payload_for(&self, intent: &Intent) -> Value {
        match self.map_payload {
            Some(ref mapper) => mapper(intent),
            None => intent.payload.clone(),
        }
    }

    /// Whether this resolution was synthesized because nothing matched.
    pub fn is_fallback(&self) -> bool {
        self.source == ResolutionSource::Fallback
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("capability", &self.capability)
            .field("command", &self.command)
            .field("provider", &self.provider)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

/// One `{capability, command, mapPayload?}` record.
#[derive(Clone)]
pub struct CapabilityRecord {
    pub capability: String,
    pub command: String,
    pub map_payload: Option<PayloadMapper>,
}

impl CapabilityRecord {
    pub fn new(capability: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            command: command.into(),
            map_payload: None,
        }
    }

    pub fn with_mapper(mut self, mapper: PayloadMapper) -> Self {
        self.map_payload = Some(mapper);
        self
    }
}

/// The two accepted registration shapes.
#[derive(Clone)]
pub enum CapabilityEntries {
    /// Capability names sharing the registration's `command`.
    Names(Vec<String>),
    /// Individual records, each with its own command.
    Records(Vec<CapabilityRecord>),
}

/// A provider's registration request.
#[derive(Clone)]
pub struct Registration {
    pub provider: String,
    pub target: Option<String>,
    pub kind: CapabilityType,
    pub capabilities: CapabilityEntries,
    /// Shared command for [`CapabilityEntries::Names`].
    pub command: Option<String>,
    /// Shared mapper for [`CapabilityEntries::Names`].
    pub map_payload: Option<PayloadMapper>,
    pub determinism: Option<Determinism>,
}

impl Registration {
    /// Register several names that all route to one command.
    pub fn names<I, S>(provider: impl Into<String>, command: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            provider: provider.into(),
            target: None,
            kind: CapabilityType::default(),
            capabilities: CapabilityEntries::Names(names.into_iter().map(Into::into).collect()),
            command: Some(command.into()),
            map_payload: None,
            determinism: None,
        }
    }

    /// Register individual records.
    pub fn records(provider: impl Into<String>, records: Vec<CapabilityRecord>) -> Self {
        Self {
            provider: provider.into(),
            target: None,
            kind: CapabilityType::default(),
            capabilities: CapabilityEntries::Records(records),
            command: None,
            map_payload: None,
            determinism: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_kind(mut self, kind: CapabilityType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_mapper(mut self, mapper: PayloadMapper) -> Self {
        self.map_payload = Some(mapper);
        self
    }

    pub fn with_determinism(mut self, determinism: Determinism) -> Self {
        self.determinism = Some(determinism);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory table of registered capabilities.
///
/// Constructed once at startup and shared by reference with the runner and
/// the provider bootstrap code.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<Vec<Capability>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider's capabilities.
    ///
    /// Returns how many entries were stored. Entries with an empty name or
    /// command are skipped, not rejected.
    pub fn register(&self, registration: Registration) -> usize {
        let Registration {
            provider,
            target,
            kind,
            capabilities,
            command,
            map_payload,
            determinism,
        } = registration;

        let records: Vec<CapabilityRecord> = match capabilities {
            CapabilityEntries::Names(names) => {
                let Some(command) = command.filter(|c| !c.trim().is_empty()) else {
                    debug!(provider = %provider, "registration without a command skipped");
                    return 0;
                };
                names
                    .into_iter()
                    .map(|name| CapabilityRecord {
                        capability: name,
                        command: command.clone(),
                        map_payload: map_payload.clone(),
                    })
                    .collect()
            }
            CapabilityEntries::Records(records) => records,
        };

        let mut entries = self.entries.write();
        let mut count = 0;
        for record in records {
            if record.capability.trim().is_empty() || record.command.trim().is_empty() {
                continue;
            }
            entries.push(Capability {
                capability: record.capability,
                command: record.command,
                provider: Some(provider.clone()),
                target: target.clone(),
                kind,
                map_payload: record.map_payload,
                determinism,
            });
            count += 1;
        }

        debug!(provider = %provider, count, "capabilities registered");
        count
    }

    /// Resolve an intent's capability names to concrete handlers.
    ///
    /// Never returns an empty list: a name nothing serves resolves to a
    /// fallback whose command is the name itself.
    pub fn resolve(&self, intent: &Intent, user_mappings: &[UserMapping]) -> Vec<Resolution> {
        let entries = self.entries.read();
        let mut resolutions = Vec::new();

        for name in intent.capability_names() {
            let from_user = select(user_mappings, name, intent);
            if !from_user.is_empty() {
                resolutions.extend(from_user.into_iter().map(|m| Resolution {
                    capability: m.capability.clone(),
                    command: m.command.clone(),
                    provider: m.provider.clone(),
                    target: m.target.clone(),
                    kind: m.kind,
                    map_payload: None,
                    source: ResolutionSource::User,
                }));
                continue;
            }

            let from_registry = select(entries.as_slice(), name, intent);
            if !from_registry.is_empty() {
                resolutions.extend(from_registry.into_iter().map(|c| Resolution {
                    capability: c.capability.clone(),
                    command: c.command.clone(),
                    provider: c.provider.clone(),
                    target: c.target.clone(),
                    kind: c.kind,
                    map_payload: c.map_payload.clone(),
                    source: ResolutionSource::Registry,
                }));
                continue;
            }

            resolutions.push(Resolution {
                capability: name.to_string(),
                command: name.to_string(),
                provider: None,
                target: None,
                kind: CapabilityType::Internal,
                map_payload: None,
                source: ResolutionSource::Fallback,
            });
        }

        resolutions
    }

    /// Snapshot of every registered capability.
    pub fn list(&self) -> Vec<Capability> {
        self.entries.read().clone()
    }

    /// Whether any provider serves a capability name.
    pub fn contains(&self, capability: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|c| c.capability == capability)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Common view over user mappings and registered capabilities.
trait Routable {
    fn capability(&self) -> &str;
    fn provider(&self) -> Option<&str>;
    fn target(&self) -> Option<&str>;
}

impl Routable for UserMapping {
    fn capability(&self) -> &str {
        &self.capability
    }
    fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }
    fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

impl Routable for Capability {
    fn capability(&self) -> &str {
        &self.capability
    }
    fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }
    fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

/// Candidates for `name`, narrowed to exact provider/target matches when the
/// intent asks for them and at least one candidate honors the request.
fn select<'a, T: Routable>(candidates: &'a [T], name: &str, intent: &Intent) -> Vec<&'a T> {
    let matches: Vec<&T> = candidates
        .iter()
        .filter(|c| c.capability() == name)
        .collect();

    if matches.is_empty() || (intent.provider.is_none() && intent.target.is_none()) {
        return matches;
    }

    let exact: Vec<&T> = matches
        .iter()
        .copied()
        .filter(|c| {
            let provider_ok = intent
                .provider
                .as_deref()
                .is_none_or(|p| c.provider() == Some(p));
            let target_ok = intent
                .target
                .as_deref()
                .is_none_or(|t| c.target() == Some(t));
            provider_ok && target_ok
        })
        .collect();

    if exact.is_empty() { matches } else { exact }
}
