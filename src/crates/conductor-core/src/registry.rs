//! Member registry - factories by name and version
//!
//! The registry maps `name@version` references to member factories.
//! Built-in members are registered at process startup, project members
//! when their definitions are parsed; after boot the registry is treated
//! as immutable, which is why lookups take cheap read locks.
//!
//! # Reference grammar
//!
//! - `name` - resolves like `name@latest`
//! - `name@1.2.3` / `name@v1.2.3` - exact semver
//! - `name@latest` - highest registered semver
//! - `name@production` - deployment label, resolved through the label map
//!   maintained by the embedder

use crate::error::{EngineError, Result};
use crate::member::{Member, MemberMetadata};
use parking_lot::RwLock;
use semver::Version;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory signature: `(config, env) -> member`
pub type MemberFactory = Arc<dyn Fn(&Value, &Value) -> Result<Arc<dyn Member>> + Send + Sync>;

/// Parsed version part of a member reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Exact(Version),
    Latest,
    Label(String),
}

/// A parsed `name` / `name@version` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub name: String,
    pub version: VersionSpec,
}

impl MemberRef {
    /// Parse a reference. A bare name means `latest`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(EngineError::Validation("empty member reference".to_string()));
        }
        let (name, version) = match reference.split_once('@') {
            None => (reference, VersionSpec::Latest),
            Some((name, version_str)) => {
                if name.is_empty() || version_str.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "malformed member reference '{reference}'"
                    )));
                }
                let spec = if version_str == "latest" {
                    VersionSpec::Latest
                } else {
                    let trimmed = version_str.strip_prefix('v').unwrap_or(version_str);
                    match Version::parse(trimmed) {
                        Ok(version) => VersionSpec::Exact(version),
                        // Anything that is not semver is a deployment label
                        Err(_) => VersionSpec::Label(version_str.to_string()),
                    }
                };
                (name, spec)
            }
        };
        Ok(Self {
            name: name.to_string(),
            version,
        })
    }
}

impl std::fmt::Display for MemberRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            VersionSpec::Latest => write!(f, "{}", self.name),
            VersionSpec::Exact(v) => write!(f, "{}@{v}", self.name),
            VersionSpec::Label(l) => write!(f, "{}@{l}", self.name),
        }
    }
}

struct Registration {
    metadata: MemberMetadata,
    version: Version,
    factory: MemberFactory,
}

/// Name+version keyed member factory store
#[derive(Default)]
pub struct MemberRegistry {
    members: RwLock<HashMap<String, Vec<Registration>>>,
    /// `(member name, label) -> exact version string`
    labels: RwLock<HashMap<(String, String), Version>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member factory under its metadata's name and version.
    /// Re-registering an existing name+version is a validation error.
    pub fn register(&self, metadata: MemberMetadata, factory: MemberFactory) -> Result<()> {
        let version_str = metadata.version.strip_prefix('v').unwrap_or(&metadata.version);
        let version = Version::parse(version_str).map_err(|e| {
            EngineError::Validation(format!(
                "member '{}' has invalid version '{}': {e}",
                metadata.name, metadata.version
            ))
        })?;

        let mut members = self.members.write();
        let registrations = members.entry(metadata.name.clone()).or_default();
        if registrations.iter().any(|r| r.version == version) {
            return Err(EngineError::Validation(format!(
                "member '{}@{version}' already registered",
                metadata.name
            )));
        }
        registrations.push(Registration {
            metadata,
            version,
            factory,
        });
        Ok(())
    }

    /// Map a deployment label (e.g. `production`) to an exact version.
    pub fn set_label(
        &self,
        name: impl Into<String>,
        label: impl Into<String>,
        version: &str,
    ) -> Result<()> {
        let version = Version::parse(version.strip_prefix('v').unwrap_or(version))
            .map_err(|e| EngineError::Validation(format!("invalid label target: {e}")))?;
        self.labels
            .write()
            .insert((name.into(), label.into()), version);
        Ok(())
    }

    fn resolve_version(&self, member_ref: &MemberRef) -> Result<Version> {
        match &member_ref.version {
            VersionSpec::Exact(version) => Ok(version.clone()),
            VersionSpec::Latest => {
                let members = self.members.read();
                members
                    .get(&member_ref.name)
                    .and_then(|rs| rs.iter().map(|r| r.version.clone()).max())
                    .ok_or_else(|| EngineError::MemberNotFound(member_ref.to_string()))
            }
            VersionSpec::Label(label) => self
                .labels
                .read()
                .get(&(member_ref.name.clone(), label.clone()))
                .cloned()
                .ok_or_else(|| EngineError::MemberNotFound(member_ref.to_string())),
        }
    }

    /// Whether a reference resolves. Used by pre-execution validation.
    pub fn contains(&self, member_ref: &MemberRef) -> bool {
        let Ok(version) = self.resolve_version(member_ref) else {
            return false;
        };
        self.members
            .read()
            .get(&member_ref.name)
            .map(|rs| rs.iter().any(|r| r.version == version))
            .unwrap_or(false)
    }

    /// Resolved metadata for a reference (name, exact version, config).
    pub fn metadata(&self, member_ref: &MemberRef) -> Result<MemberMetadata> {
        let version = self.resolve_version(member_ref)?;
        let members = self.members.read();
        members
            .get(&member_ref.name)
            .and_then(|rs| rs.iter().find(|r| r.version == version))
            .map(|r| r.metadata.clone())
            .ok_or_else(|| EngineError::MemberNotFound(member_ref.to_string()))
    }

    /// Instantiate a member for a reference.
    pub fn create(&self, member_ref: &MemberRef, env: &Value) -> Result<(Arc<dyn Member>, MemberMetadata)> {
        let version = self.resolve_version(member_ref)?;
        let members = self.members.read();
        let registration = members
            .get(&member_ref.name)
            .and_then(|rs| rs.iter().find(|r| r.version == version))
            .ok_or_else(|| EngineError::MemberNotFound(member_ref.to_string()))?;
        let member = (registration.factory)(&registration.metadata.config, env)?;
        Ok((member, registration.metadata.clone()))
    }
}
