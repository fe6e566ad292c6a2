pub mod registry;
pub mod rules;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use crate::core::Deadline;
use crate::error::CoreError;
use crate::model::{AbstractEntry, ClientMetadata, LiteralEntry};
use crate::repo::RepoSnapshot;
use crate::structures::{Structure, StructureFailure};

pub use self::registry::{
    Connector, Generator, GoalValidator, PluginRegistry, ProbeProducer, ProbeReturn,
    StatisticsSink, StructureSource,
};

/// One generator rule that matched an abstract entry. `source_index` and
/// `entry_index` identify the rule within its plugin so the plugin can
/// find it again at bind time; `plugin` is filled in by the binder.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub plugin: usize,
    pub source_index: usize,
    pub entry_index: usize,
    pub priority: i64,
    pub exact: bool,
    /// Positive `<Group>` selector names, sorted.
    pub groups: Vec<String>,
    /// Where the rule came from, for diagnostics.
    pub source: String,
}

/// Collision log, reset whenever a new snapshot is published. A
/// registration-order tie-break is reported once per (kind, name).
#[derive(Debug, Default)]
pub struct BindDiagnostics {
    reported: Mutex<HashSet<(String, String)>>,
}

impl BindDiagnostics {
    pub fn clear(&self) {
        self.reported.lock().expect("diagnostics lock").clear();
    }

    fn report_collision(&self, kind: &str, name: &str, winner: &Candidate) {
        let mut reported = self.reported.lock().expect("diagnostics lock");
        if reported.insert((kind.to_string(), name.to_string())) {
            tracing::warn!(
                kind,
                name,
                winner = %winner.source,
                "multiple equal-priority rules match; later registration wins"
            );
        }
    }
}

/// A bound structure ready for the decision filter.
#[derive(Clone, Debug)]
pub struct BoundStructure {
    pub name: String,
    pub entries: Vec<LiteralEntry>,
    /// Structure-level failure (missing bundle, validator rejection).
    pub failure: Option<StructureFailure>,
}

/// Resolve one abstract entry to exactly one literal entry. Never
/// fails: entries that cannot be bound become `<error>` entries.
pub fn bind_entry(
    registry: &PluginRegistry,
    snap: &RepoSnapshot,
    metadata: &ClientMetadata,
    entry: &AbstractEntry,
    diags: &BindDiagnostics,
) -> LiteralEntry {
    if entry.bound {
        return LiteralEntry {
            kind: entry.kind.clone(),
            name: entry.name.clone(),
            attrs: entry.attrs.clone(),
            text: entry.text.clone(),
        };
    }

    let mut candidates = Vec::new();
    for (plugin, generator) in registry.generators().iter().enumerate() {
        for mut candidate in generator.candidates(snap, metadata, entry) {
            candidate.plugin = plugin;
            candidates.push(candidate);
        }
    }

    if candidates.is_empty() {
        return LiteralEntry::error(&entry.kind, &entry.name, "no matching rule");
    }

    let mut best = 0;
    let mut registration_tie = false;
    for index in 1..candidates.len() {
        match semantic_cmp(&candidates[index], &candidates[best]) {
            Ordering::Greater => {
                best = index;
                registration_tie = false;
            }
            Ordering::Equal => {
                // Semantically indistinguishable; the later registration
                // wins and the collision is reported.
                if registration_key(&candidates[index]) > registration_key(&candidates[best]) {
                    best = index;
                }
                registration_tie = true;
            }
            Ordering::Less => {}
        }
    }

    let winner = &candidates[best];
    if registration_tie {
        diags.report_collision(&entry.kind, &entry.name, winner);
    }

    let generator = &registry.generators()[winner.plugin];
    match generator.bind(snap, metadata, winner, entry) {
        Ok(literal) => literal,
        Err(err) => {
            tracing::warn!(
                kind = %entry.kind,
                name = %entry.name,
                plugin = generator.name(),
                error = %err,
                "generator failed to bind entry"
            );
            LiteralEntry::error(&entry.kind, &entry.name, &err.to_string())
        }
    }
}

/// Bind every entry of a structure, then run the goal-validator
/// post-pass. Validator output replaces the entry list; a validator
/// failure rejects the whole structure.
pub fn bind_structure(
    registry: &PluginRegistry,
    snap: &RepoSnapshot,
    metadata: &ClientMetadata,
    structure: &Structure,
    diags: &BindDiagnostics,
    deadline: &Deadline,
) -> Result<BoundStructure, CoreError> {
    if let Some(failure) = &structure.failure {
        return Ok(BoundStructure {
            name: structure.name.clone(),
            entries: Vec::new(),
            failure: Some(failure.clone()),
        });
    }

    let mut entries = Vec::with_capacity(structure.entries.len());
    for entry in &structure.entries {
        deadline.check()?;
        entries.push(bind_entry(registry, snap, metadata, entry, diags));
    }

    for validator in registry.validators() {
        match validator.validate(metadata, &structure.name, entries) {
            Ok(replaced) => entries = replaced,
            Err(err) => {
                tracing::warn!(
                    structure = %structure.name,
                    validator = validator.name(),
                    error = %err,
                    "goal validator rejected structure"
                );
                return Ok(BoundStructure {
                    name: structure.name.clone(),
                    entries: Vec::new(),
                    failure: Some(StructureFailure::Failed(err.to_string())),
                });
            }
        }
    }

    Ok(BoundStructure {
        name: structure.name.clone(),
        entries,
        failure: None,
    })
}

/// Candidate preference, ignoring registration order. `Greater` means
/// `a` wins. Priority dominates; exact beats regex within one plugin
/// regardless of priority; group-scoped beats unscoped; a superset
/// group set beats its subsets; surviving ties fall back to the
/// lexicographic order of the sorted group set.
fn semantic_cmp(a: &Candidate, b: &Candidate) -> Ordering {
    if a.plugin == b.plugin && a.exact != b.exact {
        return if a.exact {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }

    match a.priority.cmp(&b.priority) {
        Ordering::Equal => {}
        other => return other,
    }

    if a.exact != b.exact {
        return if a.exact {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }

    let a_scoped = !a.groups.is_empty();
    let b_scoped = !b.groups.is_empty();
    if a_scoped != b_scoped {
        return if a_scoped {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }

    if a_scoped {
        let a_set: BTreeSet<&str> = a.groups.iter().map(String::as_str).collect();
        let b_set: BTreeSet<&str> = b.groups.iter().map(String::as_str).collect();
        if a_set != b_set {
            if a_set.is_superset(&b_set) {
                return Ordering::Greater;
            }
            if b_set.is_superset(&a_set) {
                return Ordering::Less;
            }
            // Incomparable scopes: the lexicographically smaller sorted
            // set wins, which keeps selection deterministic.
            return b.groups.cmp(&a.groups);
        }
    }

    Ordering::Equal
}

fn registration_key(c: &Candidate) -> (usize, usize, usize) {
    (c.plugin, c.source_index, c.entry_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(priority: i64, exact: bool, groups: &[&str]) -> Candidate {
        Candidate {
            plugin: 0,
            source_index: 0,
            entry_index: 0,
            priority,
            exact,
            groups: groups.iter().map(|g| g.to_string()).collect(),
            source: "test".to_string(),
        }
    }

    #[test]
    fn exact_beats_regex_at_any_priority_within_a_plugin() {
        let exact = candidate(10, true, &[]);
        let regex = candidate(50, false, &[]);
        assert_eq!(semantic_cmp(&exact, &regex), Ordering::Greater);
        assert_eq!(semantic_cmp(&regex, &exact), Ordering::Less);
    }

    #[test]
    fn scoped_beats_unscoped_and_superset_beats_subset() {
        let unscoped = candidate(0, true, &[]);
        let scoped = candidate(0, true, &["web"]);
        let wider = candidate(0, true, &["db", "web"]);
        assert_eq!(semantic_cmp(&scoped, &unscoped), Ordering::Greater);
        assert_eq!(semantic_cmp(&wider, &scoped), Ordering::Greater);
    }

    #[test]
    fn incomparable_scopes_break_ties_lexicographically() {
        let a = candidate(0, true, &["alpha"]);
        let b = candidate(0, true, &["beta"]);
        assert_eq!(semantic_cmp(&a, &b), Ordering::Greater);
        assert_eq!(semantic_cmp(&b, &a), Ordering::Less);
    }
}
