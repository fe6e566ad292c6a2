use std::collections::BTreeMap;

use crate::binder::rules::RuleSet;
use crate::decision::DecisionLists;
use crate::error::CoreError;
use crate::model::{ClientDecl, Conditional, GroupDef};
use crate::probes::ProbeDef;
use crate::xml::Element;

/// Immutable view of the parsed repository. Published through an
/// `ArcSwap`; readers that loaded one snapshot finish under it while a
/// reload builds and swaps in the next.
#[derive(Debug)]
pub struct RepoSnapshot {
    pub generation: u64,
    pub groups: GroupGraph,
    pub clients: BTreeMap<String, ClientDecl>,
    /// bundle name -> parsed (untemplated) fragment.
    pub bundles: BTreeMap<String, Element>,
    /// Sorted-filename registration order.
    pub rules: Vec<RuleSet>,
    pub probes: Vec<ProbeDef>,
    pub decisions: DecisionLists,
}

/// Group definitions plus the inclusion arena: adjacency is stored as
/// `group id -> [included group ids]` and expansion walks indices, so
/// cyclic inclusion degenerates to a visited-set no-op.
#[derive(Debug)]
pub struct GroupGraph {
    defs: Vec<GroupDef>,
    index: BTreeMap<String, usize>,
    edges: Vec<Vec<usize>>,
    pub conditionals: Vec<Conditional>,
}

impl GroupGraph {
    pub fn build(
        mut defs: Vec<GroupDef>,
        conditionals: Vec<Conditional>,
    ) -> Result<Self, CoreError> {
        // Groups referenced by inclusion but never declared still need
        // arena slots; they behave as empty definitions.
        let declared: Vec<String> = defs.iter().map(|d| d.name.clone()).collect();
        let mut implicit: Vec<String> = Vec::new();
        for def in &defs {
            for include in &def.includes {
                if !declared.contains(include) && !implicit.contains(include) {
                    implicit.push(include.clone());
                }
            }
        }
        for name in implicit {
            defs.push(GroupDef {
                name,
                ..GroupDef::default()
            });
        }

        let mut index = BTreeMap::new();
        for (id, def) in defs.iter().enumerate() {
            if def.default && !def.profile {
                return Err(CoreError::RepoLoad(format!(
                    "group {} is default but not a profile",
                    def.name
                )));
            }
            if index.insert(def.name.clone(), id).is_some() {
                return Err(CoreError::RepoLoad(format!(
                    "group {} declared more than once",
                    def.name
                )));
            }
        }

        let edges = defs
            .iter()
            .map(|def| {
                def.includes
                    .iter()
                    .filter_map(|name| index.get(name).copied())
                    .collect()
            })
            .collect();

        Ok(GroupGraph {
            defs,
            index,
            edges,
            conditionals,
        })
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn def(&self, id: usize) -> &GroupDef {
        &self.defs[id]
    }

    pub fn get(&self, name: &str) -> Option<&GroupDef> {
        self.id(name).map(|id| self.def(id))
    }

    pub fn includes(&self, id: usize) -> &[usize] {
        &self.edges[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupDef> {
        self.defs.iter()
    }

    pub fn default_profile(&self) -> Option<&GroupDef> {
        self.defs.iter().find(|def| def.default)
    }
}
