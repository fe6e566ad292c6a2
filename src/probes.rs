use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::binder::registry::{Connector, ProbeProducer, ProbeReturn};
use crate::error::CoreError;
use crate::model::ClientMetadata;
use crate::repo::RepoSnapshot;
use crate::xml::Element;

pub const DEFAULT_INTERPRETER: &str = "/bin/sh";
const GROUP_PREFIX: &str = "group:";

/// A script the client runs and reports back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeDef {
    pub name: String,
    /// Plugin that declared the probe; responses are dispatched back to
    /// it by this name.
    pub source: String,
    pub interpreter: String,
    pub script: String,
    /// Empty = sent to every client; otherwise only to clients active
    /// in at least one of these groups.
    pub groups: Vec<String>,
}

/// Serialize probe definitions for `GetProbes`.
pub fn probes_document(defs: &[ProbeDef]) -> Element {
    let mut root = Element::new("probes");
    for def in defs {
        root.children.push(
            Element::new("probe")
                .with_attr("name", def.name.clone())
                .with_attr("source", def.source.clone())
                .with_attr("interpreter", def.interpreter.clone())
                .with_text(def.script.clone()),
        );
    }
    root
}

#[derive(Debug, Default)]
struct ProbeStoreInner {
    /// client -> probe name -> groups supplied by that probe.
    groups: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// client -> source -> probe name -> raw output.
    data: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
}

/// Cached probe responses. Re-receiving a probe replaces only that
/// probe's prior contribution.
#[derive(Debug, Default)]
pub struct ProbeStore {
    inner: Mutex<ProbeStoreInner>,
}

impl ProbeStore {
    pub fn record(
        &self,
        client: &str,
        source: &str,
        probe: &str,
        groups: Vec<String>,
        output: Option<String>,
    ) {
        let mut inner = self.inner.lock().expect("probe store lock");
        inner
            .groups
            .entry(client.to_string())
            .or_default()
            .insert(probe.to_string(), groups.into_iter().collect());
        if let Some(output) = output {
            inner
                .data
                .entry(client.to_string())
                .or_default()
                .entry(source.to_string())
                .or_default()
                .insert(probe.to_string(), output);
        }
    }

    pub fn groups(&self, client: &str) -> BTreeSet<String> {
        let inner = self.inner.lock().expect("probe store lock");
        inner
            .groups
            .get(client)
            .map(|probes| probes.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// source -> { probe name -> output } blobs for the connector.
    pub fn data(&self, client: &str) -> BTreeMap<String, serde_json::Value> {
        let inner = self.inner.lock().expect("probe store lock");
        let Some(sources) = inner.data.get(client) else {
            return BTreeMap::new();
        };
        sources
            .iter()
            .map(|(source, probes)| {
                let blob = probes
                    .iter()
                    .map(|(name, output)| (name.clone(), serde_json::Value::String(output.clone())))
                    .collect::<serde_json::Map<String, serde_json::Value>>();
                (source.clone(), serde_json::Value::Object(blob))
            })
            .collect()
    }

    pub fn forget(&self, client: &str) {
        let mut inner = self.inner.lock().expect("probe store lock");
        inner.groups.remove(client);
        inner.data.remove(client);
    }
}

/// The built-in probe plugin: declares the repository's probes and
/// interprets their responses. `group:` lines become membership; the
/// remaining output is kept as connector data.
pub struct ProbesPlugin {
    store: Arc<ProbeStore>,
}

impl ProbesPlugin {
    pub fn new(store: Arc<ProbeStore>) -> Self {
        ProbesPlugin { store }
    }
}

impl ProbeProducer for ProbesPlugin {
    fn name(&self) -> &str {
        "Probes"
    }

    fn probes(&self, snap: &RepoSnapshot, metadata: &ClientMetadata) -> Vec<ProbeDef> {
        snap.probes
            .iter()
            .filter(|probe| {
                probe.groups.is_empty() || probe.groups.iter().any(|g| metadata.in_group(g))
            })
            .cloned()
            .collect()
    }

    fn receive_data(&self, client: &str, response: &Element) -> Result<ProbeReturn, CoreError> {
        let probe = response
            .attr("name")
            .ok_or_else(|| CoreError::plugin("Probes", "probe-data without name"))?;
        let source = response.attr("source").unwrap_or("Probes");

        let mut groups = Vec::new();
        let mut rest = Vec::new();
        for line in response.text.lines() {
            match line.trim().strip_prefix(GROUP_PREFIX) {
                Some(group) if !group.trim().is_empty() => groups.push(group.trim().to_string()),
                _ => rest.push(line),
            }
        }
        let output = rest.join("\n").trim().to_string();
        let output = (!output.is_empty()).then_some(output);

        self.store
            .record(client, source, probe, groups.clone(), output.clone());

        Ok(ProbeReturn {
            groups,
            data: output.map(serde_json::Value::String),
        })
    }
}

/// Connector exposing cached probe data to the metadata resolver.
pub struct ProbeConnector {
    store: Arc<ProbeStore>,
}

impl ProbeConnector {
    pub fn new(store: Arc<ProbeStore>) -> Self {
        ProbeConnector { store }
    }
}

impl Connector for ProbeConnector {
    fn name(&self) -> &str {
        "Probes"
    }

    fn groups(&self, client: &str) -> Vec<String> {
        self.store.groups(client).into_iter().collect()
    }

    fn data(&self, client: &str) -> BTreeMap<String, serde_json::Value> {
        self.store.data(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_lines_are_split_from_connector_output() {
        let store = Arc::new(ProbeStore::default());
        let plugin = ProbesPlugin::new(store.clone());

        let response = Element::new("probe-data")
            .with_attr("name", "osinfo")
            .with_attr("source", "Probes")
            .with_text("group:rhel6\nkernel 3.10\ngroup:x86_64");

        let ret = plugin.receive_data("c1", &response).unwrap();
        assert_eq!(ret.groups, vec!["rhel6", "x86_64"]);
        assert_eq!(
            ret.data,
            Some(serde_json::Value::String("kernel 3.10".to_string()))
        );

        let groups = store.groups("c1");
        assert!(groups.contains("rhel6") && groups.contains("x86_64"));
    }

    #[test]
    fn reprobing_replaces_prior_groups() {
        let store = Arc::new(ProbeStore::default());
        let plugin = ProbesPlugin::new(store.clone());

        let first = Element::new("probe-data")
            .with_attr("name", "osinfo")
            .with_text("group:rhel5");
        plugin.receive_data("c1", &first).unwrap();

        let second = Element::new("probe-data")
            .with_attr("name", "osinfo")
            .with_text("group:rhel6");
        plugin.receive_data("c1", &second).unwrap();

        let groups = store.groups("c1");
        assert!(groups.contains("rhel6"));
        assert!(!groups.contains("rhel5"));
    }
}
