use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::Deadline;
use crate::error::CoreError;
use crate::model::{AbstractEntry, ClientMetadata, LiteralEntry};
use crate::probes::ProbeDef;
use crate::repo::RepoSnapshot;
use crate::stats::StatsRecord;
use crate::structures::Structure;
use crate::xml::Element;

use super::Candidate;

/// Resolves abstract entries to literal ones. Candidate enumeration and
/// binding are split so the binder can apply the tie-break rules across
/// every registered generator before any handler runs.
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    fn candidates(
        &self,
        snap: &RepoSnapshot,
        metadata: &ClientMetadata,
        entry: &AbstractEntry,
    ) -> Vec<Candidate>;

    fn bind(
        &self,
        snap: &RepoSnapshot,
        metadata: &ClientMetadata,
        candidate: &Candidate,
        entry: &AbstractEntry,
    ) -> Result<LiteralEntry, CoreError>;
}

/// Produces the ordered abstract structures for a client.
pub trait StructureSource: Send + Sync {
    fn name(&self) -> &str;

    fn assemble(
        &self,
        snap: &RepoSnapshot,
        metadata: &ClientMetadata,
        deadline: &Deadline,
    ) -> Result<Vec<Structure>, CoreError>;
}

/// What a probe response contributed: group memberships, connector
/// data, or both.
#[derive(Clone, Debug, Default)]
pub struct ProbeReturn {
    pub groups: Vec<String>,
    pub data: Option<serde_json::Value>,
}

/// Declares probes and interprets their responses.
pub trait ProbeProducer: Send + Sync {
    fn name(&self) -> &str;

    fn probes(&self, snap: &RepoSnapshot, metadata: &ClientMetadata) -> Vec<ProbeDef>;

    fn receive_data(&self, client: &str, response: &Element) -> Result<ProbeReturn, CoreError>;
}

/// Attaches per-client data (and possibly extra groups) to metadata
/// under construction.
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    fn groups(&self, _client: &str) -> Vec<String> {
        Vec::new()
    }

    /// connector-name -> opaque blob entries.
    fn data(&self, _client: &str) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }
}

/// Amends or rejects a bound structure as a whole (e.g. dependency
/// closure). Runs after every entry in the structure is bound.
pub trait GoalValidator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(
        &self,
        metadata: &ClientMetadata,
        structure: &str,
        entries: Vec<LiteralEntry>,
    ) -> Result<Vec<LiteralEntry>, CoreError>;
}

/// Downstream consumer of client run statistics.
pub trait StatisticsSink: Send + Sync {
    fn name(&self) -> &str;

    fn store(&self, record: &StatsRecord) -> Result<(), CoreError>;
}

/// Typed capability slots. A plugin is a value registered into one slot
/// per capability it implements; registration order is significant and
/// participates in binder tie-breaking.
#[derive(Default)]
pub struct PluginRegistry {
    generators: Vec<Arc<dyn Generator>>,
    structures: Vec<Arc<dyn StructureSource>>,
    probe_producers: Vec<Arc<dyn ProbeProducer>>,
    connectors: Vec<Arc<dyn Connector>>,
    validators: Vec<Arc<dyn GoalValidator>>,
    sinks: Vec<Arc<dyn StatisticsSink>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    pub fn register_generator(&mut self, plugin: Arc<dyn Generator>) {
        self.generators.push(plugin);
    }

    pub fn register_structure_source(&mut self, plugin: Arc<dyn StructureSource>) {
        self.structures.push(plugin);
    }

    pub fn register_probe_producer(&mut self, plugin: Arc<dyn ProbeProducer>) {
        self.probe_producers.push(plugin);
    }

    pub fn register_connector(&mut self, plugin: Arc<dyn Connector>) {
        self.connectors.push(plugin);
    }

    pub fn register_goal_validator(&mut self, plugin: Arc<dyn GoalValidator>) {
        self.validators.push(plugin);
    }

    pub fn register_statistics_sink(&mut self, plugin: Arc<dyn StatisticsSink>) {
        self.sinks.push(plugin);
    }

    pub fn generators(&self) -> &[Arc<dyn Generator>] {
        &self.generators
    }

    pub fn structure_sources(&self) -> &[Arc<dyn StructureSource>] {
        &self.structures
    }

    pub fn probe_producers(&self) -> &[Arc<dyn ProbeProducer>] {
        &self.probe_producers
    }

    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    pub fn validators(&self) -> &[Arc<dyn GoalValidator>] {
        &self.validators
    }

    pub fn sinks(&self) -> &[Arc<dyn StatisticsSink>] {
        &self.sinks
    }
}
