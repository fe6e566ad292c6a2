use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::model::{Conditional, GroupAssign, Predicate};
use crate::repo::GroupGraph;

/// Upper bound on conditional re-evaluation rounds. Real repositories
/// converge in two or three; hitting the bound means the conditionals
/// oscillate.
const MAX_ROUNDS: usize = 100;

/// Result of expanding a client's seed groups over the group graph.
#[derive(Clone, Debug, Default)]
pub struct Expansion {
    pub groups: BTreeSet<String>,
    /// Shortest provenance-chain length per active group.
    pub depths: BTreeMap<String, usize>,
    /// category -> the single group left holding it.
    pub categories: BTreeMap<String, String>,
    /// Ordered by (contributing depth, bundle name), deduplicated.
    pub bundles: Vec<String>,
}

/// Expand seed memberships over the group graph.
///
/// Seeds (profile, declared groups, probe groups) start at depth 0.
/// Inclusion edges are walked breadth-first; conditionals are
/// re-evaluated against the active set until a fixed point; negations
/// ban a group outright, which also removes anything reachable only
/// through it. Category exclusivity is enforced once at the end, after
/// every membership source has been merged.
pub fn expand(
    graph: &GroupGraph,
    client: &str,
    declared: &[GroupAssign],
    probe_groups: &BTreeSet<String>,
) -> Expansion {
    let mut base_seeds: Vec<(String, usize)> = Vec::new();
    let mut base_banned: BTreeSet<String> = BTreeSet::new();
    for assign in declared {
        if assign.negate {
            base_banned.insert(assign.name.clone());
        } else {
            base_seeds.push((assign.name.clone(), 0));
        }
    }
    for group in probe_groups {
        base_seeds.push((group.clone(), 0));
    }

    let mut seeds = base_seeds.clone();
    let mut banned = base_banned.clone();
    let mut depths = reach(graph, &seeds, &banned);
    let mut cond_bundles: Vec<(usize, String, String)> = Vec::new();

    for round in 0.. {
        if round >= MAX_ROUNDS {
            tracing::warn!(client, "conditional group expansion did not converge");
            break;
        }

        seeds = base_seeds.clone();
        banned = base_banned.clone();
        cond_bundles.clear();
        for conditional in &graph.conditionals {
            apply_conditional(
                conditional,
                client,
                &depths,
                &mut seeds,
                &mut banned,
                &mut cond_bundles,
            );
        }

        let next = reach(graph, &seeds, &banned);
        if next == depths {
            break;
        }
        depths = next;
    }

    let mut expansion = Expansion {
        groups: depths.keys().cloned().collect(),
        depths,
        categories: BTreeMap::new(),
        bundles: Vec::new(),
    };

    enforce_categories(graph, client, &mut expansion);
    collect_bundles(graph, &cond_bundles, &mut expansion);
    expansion
}

/// Breadth-first reachability over the inclusion arena. Banned groups
/// are never entered, so anything reachable only through them stays
/// out. Returns the shortest chain length per reached group; group
/// names unknown to the graph (probe-supplied) are reached as plain
/// members without edges.
fn reach(
    graph: &GroupGraph,
    seeds: &[(String, usize)],
    banned: &BTreeSet<String>,
) -> BTreeMap<String, usize> {
    let mut depths: BTreeMap<String, usize> = BTreeMap::new();
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();

    let mut ordered: Vec<&(String, usize)> = seeds.iter().collect();
    ordered.sort_by_key(|(_, depth)| *depth);

    for (name, depth) in ordered {
        if banned.contains(name) {
            continue;
        }
        let improved = depths.get(name).is_none_or(|d| depth < d);
        if !improved {
            continue;
        }
        depths.insert(name.clone(), *depth);
        if let Some(id) = graph.id(name) {
            queue.push_back((id, *depth));
        }
    }

    while let Some((id, depth)) = queue.pop_front() {
        for &included in graph.includes(id) {
            let name = &graph.def(included).name;
            if banned.contains(name) {
                continue;
            }
            let next = depth + 1;
            let improved = depths.get(name).is_none_or(|d| next < *d);
            if improved {
                depths.insert(name.clone(), next);
                queue.push_back((included, next));
            }
        }
    }

    depths
}

fn apply_conditional(
    conditional: &Conditional,
    client: &str,
    depths: &BTreeMap<String, usize>,
    seeds: &mut Vec<(String, usize)>,
    banned: &mut BTreeSet<String>,
    bundles: &mut Vec<(usize, String, String)>,
) {
    let (fires, trigger, trigger_depth) = match &conditional.predicate {
        Predicate::Group { name, negate } => {
            let active = depths.contains_key(name);
            (
                active != *negate,
                name.clone(),
                depths.get(name).copied().unwrap_or(0),
            )
        }
        Predicate::Client { name, negate } => ((client == name) != *negate, client.to_string(), 0),
    };
    if !fires {
        return;
    }

    let contributed = trigger_depth + 1;
    for assign in &conditional.groups {
        if assign.negate {
            banned.insert(assign.name.clone());
        } else {
            seeds.push((assign.name.clone(), contributed));
        }
    }
    for bundle in &conditional.bundles {
        bundles.push((contributed, bundle.clone(), trigger.clone()));
    }
    for nested in &conditional.nested {
        apply_conditional(nested, client, depths, seeds, banned, bundles);
    }
}

/// At most one active group per category. The member with the shortest
/// provenance chain wins, ties broken by lexicographic name; losers are
/// removed with a warning. Looping handles a loser that was itself
/// holding a second category slot.
fn enforce_categories(graph: &GroupGraph, client: &str, expansion: &mut Expansion) {
    loop {
        let losers = {
            let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for name in &expansion.groups {
                if let Some(category) = graph.get(name).and_then(|def| def.category.clone()) {
                    by_category.entry(category).or_default().push(name.clone());
                }
            }

            let mut losers: Vec<String> = Vec::new();
            for (category, members) in &by_category {
                if members.len() <= 1 {
                    continue;
                }
                let winner = members
                    .iter()
                    .min_by_key(|name| {
                        (expansion.depths.get(name.as_str()).copied(), (*name).clone())
                    })
                    .cloned()
                    .unwrap_or_else(|| members[0].clone());
                tracing::warn!(
                    client,
                    category,
                    winner,
                    "category held by multiple groups; keeping shortest chain"
                );
                losers.extend(members.iter().filter(|name| **name != winner).cloned());
            }
            losers
        };

        if losers.is_empty() {
            break;
        }
        for loser in losers {
            expansion.groups.remove(&loser);
            expansion.depths.remove(&loser);
        }
    }

    for name in &expansion.groups {
        if let Some(def) = graph.get(name) {
            if let Some(category) = &def.category {
                expansion
                    .categories
                    .insert(category.clone(), name.clone());
            }
        }
    }
}

fn collect_bundles(
    graph: &GroupGraph,
    cond_bundles: &[(usize, String, String)],
    expansion: &mut Expansion,
) {
    let mut weighted: Vec<(usize, String)> = Vec::new();
    for name in &expansion.groups {
        if let Some(def) = graph.get(name) {
            let depth = expansion.depths.get(name).copied().unwrap_or(0);
            for bundle in &def.bundles {
                weighted.push((depth, bundle.clone()));
            }
        }
    }
    for (depth, bundle, trigger) in cond_bundles {
        // Bundles from a conditional only count while the triggering
        // group survived category enforcement.
        if expansion.groups.contains(trigger) || graph.get(trigger).is_none() {
            weighted.push((*depth, bundle.clone()));
        }
    }

    weighted.sort();
    let mut seen = BTreeSet::new();
    for (_, bundle) in weighted {
        if seen.insert(bundle.clone()) {
            expansion.bundles.push(bundle);
        }
    }
}
