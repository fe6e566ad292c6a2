use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Frozen per-client metadata snapshot. Immutable once produced;
/// memoized by the core until the repository or probe data changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMetadata {
    pub hostname: String,
    pub profile: Option<String>,
    pub groups: BTreeSet<String>,
    /// category -> the single active group holding it.
    pub categories: BTreeMap<String, String>,
    pub aliases: BTreeSet<String>,
    pub addresses: BTreeSet<IpAddr>,
    pub uuid: Option<String>,
    pub password: Option<String>,
    /// Expansion order: group-inclusion depth, then bundle name.
    pub bundles: Vec<String>,
    /// connector name -> opaque per-client blob.
    pub connectors: BTreeMap<String, serde_json::Value>,
    pub version: Option<String>,
}

impl ClientMetadata {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// `<Group name=… negate=…>` predicate against this client.
    pub fn group_predicate(&self, name: &str, negate: bool) -> bool {
        self.in_group(name) != negate
    }

    /// `<Client name=… negate=…>` predicate against this client.
    pub fn client_predicate(&self, name: &str, negate: bool) -> bool {
        let matches = self.hostname == name || self.aliases.contains(name);
        matches != negate
    }
}
