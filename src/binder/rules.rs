use std::collections::BTreeMap;

use regex::Regex;

use crate::error::CoreError;
use crate::model::{AbstractEntry, ClientMetadata, GroupAssign, LiteralEntry};
use crate::repo::RepoSnapshot;
use crate::xml::Element;

use super::registry::Generator;
use super::Candidate;

/// One parsed `Rules/*.xml` file. Files are registered in sorted
/// filename order; that order breaks otherwise-equal candidates.
#[derive(Debug)]
pub struct RuleSet {
    pub source: String,
    pub priority: i64,
    pub entries: Vec<RuleEntry>,
}

#[derive(Debug)]
pub struct RuleEntry {
    pub kind: String,
    pub name: String,
    /// Anchored pattern, compiled only when regex matching is enabled.
    pub pattern: Option<Regex>,
    pub group_selectors: Vec<GroupAssign>,
    pub client_selectors: Vec<GroupAssign>,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
}

/// Parse a rules document. `<Group>`/`<Client>` wrappers apply
/// conjunctively to every entry nested inside them.
pub fn parse_rules_document(
    source: &str,
    root: &Element,
    regex_enabled: bool,
) -> Result<RuleSet, CoreError> {
    let priority = match root.attr("priority") {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            CoreError::RepoLoad(format!("{source}: invalid priority {raw:?}"))
        })?,
        None => 0,
    };

    let mut entries = Vec::new();
    collect_entries(
        source,
        root,
        regex_enabled,
        &mut Vec::new(),
        &mut Vec::new(),
        &mut entries,
    )?;

    Ok(RuleSet {
        source: source.to_string(),
        priority,
        entries,
    })
}

fn collect_entries(
    source: &str,
    el: &Element,
    regex_enabled: bool,
    groups: &mut Vec<GroupAssign>,
    clients: &mut Vec<GroupAssign>,
    out: &mut Vec<RuleEntry>,
) -> Result<(), CoreError> {
    for child in &el.children {
        let name = match child.attr("name") {
            Some(name) => name.to_string(),
            None => continue,
        };

        match child.name.as_str() {
            "Group" => {
                groups.push(GroupAssign {
                    name,
                    negate: child.bool_attr("negate"),
                });
                collect_entries(source, child, regex_enabled, groups, clients, out)?;
                groups.pop();
            }
            "Client" => {
                clients.push(GroupAssign {
                    name,
                    negate: child.bool_attr("negate"),
                });
                collect_entries(source, child, regex_enabled, groups, clients, out)?;
                clients.pop();
            }
            _ => {
                let pattern = if regex_enabled {
                    Some(Regex::new(&format!("^(?:{})$", name)).map_err(|err| {
                        CoreError::RepoLoad(format!("{source}: bad rule pattern {name:?}: {err}"))
                    })?)
                } else {
                    None
                };
                let mut attrs = child.attrs.clone();
                attrs.remove("name");
                out.push(RuleEntry {
                    kind: child.name.clone(),
                    name,
                    pattern,
                    group_selectors: groups.clone(),
                    client_selectors: clients.clone(),
                    attrs,
                    text: child.text.clone(),
                });
            }
        }
    }
    Ok(())
}

fn selectors_match(rule: &RuleEntry, metadata: &ClientMetadata) -> bool {
    rule.group_selectors
        .iter()
        .all(|g| metadata.group_predicate(&g.name, g.negate))
        && rule
            .client_selectors
            .iter()
            .all(|c| metadata.client_predicate(&c.name, c.negate))
}

/// The built-in rule-file generator.
pub struct RulesGenerator;

impl Generator for RulesGenerator {
    fn name(&self) -> &str {
        "Rules"
    }

    fn candidates(
        &self,
        snap: &RepoSnapshot,
        metadata: &ClientMetadata,
        entry: &AbstractEntry,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        for (source_index, set) in snap.rules.iter().enumerate() {
            for (entry_index, rule) in set.entries.iter().enumerate() {
                if rule.kind != entry.kind {
                    continue;
                }

                let exact = rule.name == entry.name;
                let regex_hit = !exact
                    && rule
                        .pattern
                        .as_ref()
                        .is_some_and(|p| p.is_match(&entry.name));
                if !exact && !regex_hit {
                    continue;
                }

                if !selectors_match(rule, metadata) {
                    continue;
                }

                let mut scope: Vec<String> = rule
                    .group_selectors
                    .iter()
                    .filter(|g| !g.negate)
                    .map(|g| g.name.clone())
                    .collect();
                scope.sort();

                out.push(Candidate {
                    plugin: 0,
                    source_index,
                    entry_index,
                    priority: set.priority,
                    exact,
                    groups: scope,
                    source: set.source.clone(),
                });
            }
        }
        out
    }

    fn bind(
        &self,
        snap: &RepoSnapshot,
        _metadata: &ClientMetadata,
        candidate: &Candidate,
        entry: &AbstractEntry,
    ) -> Result<LiteralEntry, CoreError> {
        let rule = snap
            .rules
            .get(candidate.source_index)
            .and_then(|set| set.entries.get(candidate.entry_index))
            .ok_or_else(|| CoreError::plugin("Rules", "candidate no longer in snapshot"))?;

        // The bundle's declared attributes win over rule attributes.
        let mut attrs = rule.attrs.clone();
        for (key, value) in &entry.attrs {
            attrs.insert(key.clone(), value.clone());
        }

        Ok(LiteralEntry {
            kind: entry.kind.clone(),
            name: entry.name.clone(),
            attrs,
            text: if entry.text.is_empty() {
                rule.text.clone()
            } else {
                entry.text.clone()
            },
        })
    }
}
