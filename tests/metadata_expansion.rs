mod common;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use common::RepoFixture;
use weave::error::CoreError;
use weave::metadata::build_metadata;
use weave::repo::load_snapshot;

fn fixture(groups: &str, clients: &str) -> Result<RepoFixture> {
    let repo = RepoFixture::new()?;
    repo.write("Metadata/groups.xml", groups)?;
    repo.write("Metadata/clients.xml", clients)?;
    Ok(repo)
}

#[test]
fn profile_only_client_gets_its_profile_bundles() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="web" profile="true" public="true">
               <Bundle name="nginx"/>
             </Group>
           </Groups>"#,
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;
    let metadata = build_metadata(&snap, decl, &BTreeSet::new(), BTreeMap::new())?;

    assert_eq!(metadata.profile.as_deref(), Some("web"));
    assert!(metadata.groups.contains("web"));
    assert_eq!(metadata.bundles, vec!["nginx".to_string()]);
    Ok(())
}

#[test]
fn no_profile_and_no_default_is_a_consistency_error() -> Result<()> {
    let repo = fixture(
        r#"<Groups><Group name="web" profile="true"/></Groups>"#,
        r#"<Clients><Client name="c1"/></Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;
    let err = build_metadata(&snap, decl, &BTreeSet::new(), BTreeMap::new()).unwrap_err();
    assert!(matches!(err, CoreError::MetadataConsistency(_)));
    Ok(())
}

#[test]
fn default_profile_backfills_missing_client_profile() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="basic" profile="true" default="true">
               <Bundle name="base"/>
             </Group>
           </Groups>"#,
        r#"<Clients><Client name="c1"/></Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;
    let metadata = build_metadata(&snap, decl, &BTreeSet::new(), BTreeMap::new())?;
    assert_eq!(metadata.profile.as_deref(), Some("basic"));
    assert_eq!(metadata.bundles, vec!["base".to_string()]);
    Ok(())
}

#[test]
fn negation_over_an_inclusion_chain_spares_the_intermediate() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="foo-server" profile="true">
               <Group name="apache-server"/>
             </Group>
             <Group name="apache-server">
               <Group name="selinux-enabled"/>
             </Group>
           </Groups>"#,
        r#"<Clients>
             <Client name="c1" profile="foo-server">
               <Group name="selinux-enabled" negate="true"/>
             </Client>
           </Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;
    let metadata = build_metadata(&snap, decl, &BTreeSet::new(), BTreeMap::new())?;

    assert!(metadata.groups.contains("apache-server"));
    assert!(!metadata.groups.contains("selinux-enabled"));
    Ok(())
}

#[test]
fn probe_supplied_group_displaces_an_included_category_member() -> Result<()> {
    // rhel5 arrives through inclusion (depth 1); the probe supplies
    // rhel6 as a seed (depth 0). Both hold category "os".
    let repo = fixture(
        r#"<Groups>
             <Group name="web" profile="true">
               <Group name="rhel5"/>
               <Bundle name="httpd"/>
             </Group>
             <Group name="rhel5" category="os">
               <Bundle name="five"/>
             </Group>
             <Group name="rhel6" category="os">
               <Bundle name="six"/>
             </Group>
           </Groups>"#,
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;

    let without = build_metadata(&snap, decl, &BTreeSet::new(), BTreeMap::new())?;
    assert!(without.groups.contains("rhel5"));
    assert_eq!(without.categories.get("os").map(String::as_str), Some("rhel5"));

    let mut probes = BTreeSet::new();
    probes.insert("rhel6".to_string());
    let with = build_metadata(&snap, decl, &probes, BTreeMap::new())?;

    assert!(with.groups.contains("rhel6"));
    assert!(!with.groups.contains("rhel5"));
    assert_eq!(with.categories.get("os").map(String::as_str), Some("rhel6"));
    assert!(with.bundles.contains(&"six".to_string()));
    assert!(!with.bundles.contains(&"five".to_string()));
    Ok(())
}

#[test]
fn at_most_one_group_per_category_survives() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="web" profile="true">
               <Group name="rhel5"/>
               <Group name="rhel6"/>
             </Group>
             <Group name="rhel5" category="os"/>
             <Group name="rhel6" category="os"/>
           </Groups>"#,
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;
    let metadata = build_metadata(&snap, decl, &BTreeSet::new(), BTreeMap::new())?;

    let in_category: Vec<&String> = metadata
        .groups
        .iter()
        .filter(|g| g.as_str() == "rhel5" || g.as_str() == "rhel6")
        .collect();
    assert_eq!(in_category.len(), 1);
    // Equal depth; lexicographic tie-break keeps rhel5.
    assert_eq!(in_category[0], "rhel5");
    assert_eq!(
        metadata.categories.get("os"),
        Some(&"rhel5".to_string())
    );
    Ok(())
}

#[test]
fn client_conditionals_in_groups_xml_apply_per_client() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="web" profile="true"/>
             <Client name="c1">
               <Group name="canary"/>
               <Bundle name="canary-tools"/>
             </Client>
           </Groups>"#,
        r#"<Clients>
             <Client name="c1" profile="web"/>
             <Client name="c2" profile="web"/>
           </Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;

    let c1 = snap.clients.get("c1").context("c1 declared")?;
    let m1 = build_metadata(&snap, c1, &BTreeSet::new(), BTreeMap::new())?;
    assert!(m1.groups.contains("canary"));
    assert_eq!(m1.bundles, vec!["canary-tools".to_string()]);

    let c2 = snap.clients.get("c2").context("c2 declared")?;
    let m2 = build_metadata(&snap, c2, &BTreeSet::new(), BTreeMap::new())?;
    assert!(!m2.groups.contains("canary"));
    assert!(m2.bundles.is_empty());
    Ok(())
}

#[test]
fn group_conditionals_nest_and_fire_on_activity() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="web" profile="true">
               <Group name="tls">
                 <Bundle name="certs"/>
               </Group>
             </Group>
             <Group name="tls"/>
           </Groups>"#,
        r#"<Clients>
             <Client name="secure-host" profile="web">
               <Group name="tls"/>
             </Client>
             <Client name="plain-host" profile="web"/>
           </Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;

    let secure = snap.clients.get("secure-host").context("declared")?;
    let m = build_metadata(&snap, secure, &BTreeSet::new(), BTreeMap::new())?;
    assert_eq!(m.bundles, vec!["certs".to_string()]);

    let plain = snap.clients.get("plain-host").context("declared")?;
    let m = build_metadata(&snap, plain, &BTreeSet::new(), BTreeMap::new())?;
    assert!(m.bundles.is_empty());
    Ok(())
}

#[test]
fn probe_response_with_no_new_groups_is_idempotent() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="web" profile="true">
               <Group name="base"/>
             </Group>
             <Group name="base"/>
           </Groups>"#,
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;

    let before = build_metadata(&snap, decl, &BTreeSet::new(), BTreeMap::new())?;
    let mut probes = BTreeSet::new();
    probes.insert("base".to_string());
    let after = build_metadata(&snap, decl, &probes, BTreeMap::new())?;

    assert_eq!(before.groups, after.groups);
    assert_eq!(before.categories, after.categories);
    Ok(())
}

#[test]
fn category_invariant_holds_for_every_expansion() -> Result<()> {
    let repo = fixture(
        r#"<Groups>
             <Group name="web" profile="true">
               <Group name="rhel5"/>
             </Group>
             <Group name="rhel5" category="os"/>
             <Group name="rhel6" category="os"/>
             <Group name="x86" category="arch"/>
           </Groups>"#,
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let decl = snap.clients.get("c1").context("c1 declared")?;
    let mut probes = BTreeSet::new();
    probes.insert("rhel6".to_string());
    probes.insert("x86".to_string());
    let metadata = build_metadata(&snap, decl, &probes, BTreeMap::new())?;

    // Every category maps to a group that is actually active.
    for (category, holder) in &metadata.categories {
        assert!(
            metadata.groups.contains(holder),
            "category {category} held by inactive group {holder}"
        );
    }
    Ok(())
}
