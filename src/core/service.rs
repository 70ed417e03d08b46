use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Stable identifier of one external capability provider family.
///
/// Tags become part of secret-file names and of the tool names shown to the
/// model, so they are restricted to `[A-Za-z0-9_-]`, at most 32 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceTag(String);

const MAX_TAG_LEN: usize = 32;

impl ServiceTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, InvalidServiceTag> {
        let tag = tag.into();
        if tag.is_empty() || tag.len() > MAX_TAG_LEN {
            return Err(InvalidServiceTag(tag));
        }
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(InvalidServiceTag(tag));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceTag {
    type Error = InvalidServiceTag;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceTag> for String {
    fn from(tag: ServiceTag) -> Self {
        tag.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid service tag '{0}': expected 1-32 characters of [A-Za-z0-9_-]")]
pub struct InvalidServiceTag(pub String);

fn default_secret_env() -> String {
    "TOOLHOST_SECRET_FILE".to_string()
}

/// How to launch the worker subprocess for one service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceDefinition {
    pub tag: ServiceTag,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment variable through which the worker learns its secret-file path.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

/// Configured services, looked up by tag.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceTag, ServiceDefinition>,
}

impl ServiceRegistry {
    pub fn new(definitions: impl IntoIterator<Item = ServiceDefinition>) -> Self {
        let services = definitions
            .into_iter()
            .map(|def| (def.tag.clone(), def))
            .collect();
        Self { services }
    }

    pub fn get(&self, tag: &ServiceTag) -> Option<&ServiceDefinition> {
        self.services.get(tag)
    }

    /// Definitions sorted by tag, for stable listings.
    pub fn all(&self) -> Vec<&ServiceDefinition> {
        let mut defs: Vec<_> = self.services.values().collect();
        defs.sort_by(|a, b| a.tag.cmp(&b.tag));
        defs
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
