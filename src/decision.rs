use std::collections::BTreeSet;

use crate::error::CoreError;
use crate::model::{ClientMetadata, GroupAssign, LiteralEntry};
use crate::options::DecisionMode;
use crate::xml::Element;

/// One `(kind, name)` pair from a decision list, optionally restricted
/// to clients active in every (non-negated) wrapping group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionEntry {
    pub kind: String,
    pub name: String,
    pub groups: Vec<GroupAssign>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecisionLists {
    pub whitelist: Vec<DecisionEntry>,
    pub blacklist: Vec<DecisionEntry>,
}

/// Parse `Decisions/whitelist.xml` / `Decisions/blacklist.xml`:
/// `<Decisions>` containing `<Decision kind name/>` leaves, nested in
/// optional `<Group>` wrappers.
pub fn parse_decision_document(source: &str, root: &Element) -> Result<Vec<DecisionEntry>, CoreError> {
    let mut out = Vec::new();
    collect(source, root, &mut Vec::new(), &mut out)?;
    Ok(out)
}

fn collect(
    source: &str,
    el: &Element,
    groups: &mut Vec<GroupAssign>,
    out: &mut Vec<DecisionEntry>,
) -> Result<(), CoreError> {
    for child in &el.children {
        match child.name.as_str() {
            "Group" => {
                let name = child
                    .attr("name")
                    .ok_or_else(|| CoreError::RepoLoad(format!("{source}: Group without name")))?;
                groups.push(GroupAssign {
                    name: name.to_string(),
                    negate: child.bool_attr("negate"),
                });
                collect(source, child, groups, out)?;
                groups.pop();
            }
            "Decision" => {
                let kind = child.attr("kind").ok_or_else(|| {
                    CoreError::RepoLoad(format!("{source}: Decision without kind"))
                })?;
                let name = child.attr("name").ok_or_else(|| {
                    CoreError::RepoLoad(format!("{source}: Decision without name"))
                })?;
                out.push(DecisionEntry {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    groups: groups.clone(),
                });
            }
            other => {
                return Err(CoreError::RepoLoad(format!(
                    "{source}: unexpected element {other}"
                )));
            }
        }
    }
    Ok(())
}

impl DecisionLists {
    fn list(&self, mode: DecisionMode) -> &[DecisionEntry] {
        match mode {
            DecisionMode::Whitelist => &self.whitelist,
            DecisionMode::Blacklist => &self.blacklist,
            DecisionMode::Off => &[],
        }
    }

    /// The `(kind, name)` pairs visible to this client, sorted and
    /// deduplicated.
    pub fn visible(&self, mode: DecisionMode, metadata: &ClientMetadata) -> Vec<(String, String)> {
        let mut set = BTreeSet::new();
        for entry in self.list(mode) {
            let applies = entry
                .groups
                .iter()
                .all(|g| metadata.group_predicate(&g.name, g.negate));
            if applies {
                set.insert((entry.kind.clone(), entry.name.clone()));
            }
        }
        set.into_iter().collect()
    }

    /// Filter a bound entry list. Runs after binding and before
    /// serialization; `<error>` entries always pass. Whitelisting is
    /// idempotent and blacklisting twice equals blacklisting once.
    pub fn apply(
        &self,
        mode: DecisionMode,
        metadata: &ClientMetadata,
        entries: Vec<LiteralEntry>,
    ) -> Vec<LiteralEntry> {
        if mode == DecisionMode::Off {
            return entries;
        }
        let listed: BTreeSet<(String, String)> = self.visible(mode, metadata).into_iter().collect();
        entries
            .into_iter()
            .filter(|entry| {
                if entry.is_error() {
                    return true;
                }
                let key = (entry.kind.clone(), entry.name.clone());
                match mode {
                    DecisionMode::Whitelist => listed.contains(&key),
                    DecisionMode::Blacklist => !listed.contains(&key),
                    DecisionMode::Off => true,
                }
            })
            .collect()
    }
}
