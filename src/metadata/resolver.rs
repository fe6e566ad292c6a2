use std::collections::{BTreeMap, BTreeSet};

use crate::error::CoreError;
use crate::model::{ClientDecl, ClientMetadata, GroupAssign};
use crate::repo::RepoSnapshot;

use super::expansion::expand;

/// Produce the frozen metadata snapshot for one client.
///
/// The profile seeds the expansion together with the client's declared
/// groups and any probe-supplied groups; connector blobs are attached
/// verbatim. A client with neither a profile nor a default profile
/// group to fall back on cannot be resolved.
pub fn build_metadata(
    snap: &RepoSnapshot,
    decl: &ClientDecl,
    probe_groups: &BTreeSet<String>,
    connectors: BTreeMap<String, serde_json::Value>,
) -> Result<ClientMetadata, CoreError> {
    let profile = decl
        .profile
        .clone()
        .or_else(|| snap.groups.default_profile().map(|g| g.name.clone()))
        .ok_or_else(|| {
            CoreError::MetadataConsistency(format!(
                "client {} has no profile and no default profile group exists",
                decl.name
            ))
        })?;

    if let Some(def) = snap.groups.get(&profile) {
        if !def.profile {
            tracing::warn!(
                client = %decl.name,
                profile,
                "assigned profile group is not marked as a profile"
            );
        }
    }

    let mut declared = Vec::with_capacity(decl.declared_groups.len() + 1);
    declared.push(GroupAssign::member(profile.clone()));
    declared.extend(decl.declared_groups.iter().cloned());

    let expansion = expand(&snap.groups, &decl.name, &declared, probe_groups);

    Ok(ClientMetadata {
        hostname: decl.name.clone(),
        profile: Some(profile),
        groups: expansion.groups,
        categories: expansion.categories,
        aliases: decl.aliases.clone(),
        addresses: decl.addresses.clone(),
        uuid: decl.uuid.clone(),
        password: decl.password.clone(),
        bundles: expansion.bundles,
        connectors,
        version: decl.version.clone(),
    })
}
