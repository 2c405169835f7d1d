use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Grants every tool when present in a permission set's tool list.
pub const ANY_TOOL: &str = "*";

/// A resource a tool needs beyond being named in the tool allow-list.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    NetworkAccess { allowed_hosts: Vec<String> },
    MemoryRead,
    MemoryWrite,
    DatabaseQuery,
}

/// The tool permissions an agent node declares.
///
/// Empty by default, which denies every tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    tools: BTreeSet<String>,
    #[serde(default)]
    capabilities: BTreeSet<Capability>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permission set that allows every tool and every capability listed.
    pub fn allow_all(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let mut perms = Self::new();
        perms.grant_tool(ANY_TOOL);
        for cap in capabilities {
            perms.grant(cap);
        }
        perms
    }

    pub fn with_tools<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn grant_tool(&mut self, name: impl Into<String>) {
        self.tools.insert(name.into());
    }

    pub fn revoke_tool(&mut self, name: &str) {
        self.tools.remove(name);
    }

    pub fn grant(&mut self, cap: Capability) {
        self.capabilities.insert(cap);
    }

    pub fn revoke(&mut self, cap: &Capability) {
        self.capabilities.remove(cap);
    }

    /// Builder form of [`PermissionSet::grant`].
    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.grant(cap);
        self
    }

    pub fn has(&self, cap: &Capability) -> bool {
        self.capabilities.contains(cap)
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.tools.contains(ANY_TOOL) || self.tools.contains(name)
    }

    pub fn check_network(&self, host: &str) -> bool {
        self.capabilities.iter().any(|c| match c {
            Capability::NetworkAccess { allowed_hosts } => {
                allowed_hosts.iter().any(|h| h == "*" || host.ends_with(h))
            }
            _ => false,
        })
    }

    /// Whether a capability required by a tool is covered by this set.
    pub fn satisfies(&self, required: &Capability) -> bool {
        match required {
            Capability::NetworkAccess { allowed_hosts } => {
                allowed_hosts.iter().all(|host| self.check_network(host))
            }
            other => self.has(other),
        }
    }

    /// Checks a tool invocation. Returns the denial reason on failure.
    pub fn check(&self, tool: &str, required: &[Capability]) -> Result<(), String> {
        if !self.allows_tool(tool) {
            return Err(format!("tool '{tool}' is not in the node's permissions"));
        }
        match required.iter().find(|cap| !self.satisfies(cap)) {
            Some(cap) => Err(format!("tool '{tool}' requires capability {cap:?}")),
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.capabilities.is_empty()
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }
}
