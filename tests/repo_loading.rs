mod common;

use std::sync::Arc;

use anyhow::Result;

use common::RepoFixture;
use weave::core::Core;
use weave::error::CoreError;
use weave::metadata::NoReverseResolver;
use weave::repo::load_snapshot;

#[test]
fn include_elements_splice_referenced_documents() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="web" profile="true"/>
             <xi:include href="os-groups.xml"/>
           </Groups>"#,
    )?;
    repo.write(
        "Metadata/os-groups.xml",
        r#"<Groups>
             <Group name="rhel6" category="os"/>
             <Group name="rhel7" category="os"/>
           </Groups>"#,
    )?;

    let snap = load_snapshot(&repo.options(), 1)?;
    assert!(snap.groups.get("web").is_some());
    assert!(snap.groups.get("rhel6").is_some());
    assert!(snap.groups.get("rhel7").is_some());
    Ok(())
}

#[test]
fn include_cycles_fail_the_load() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups><xi:include href="a.xml"/></Groups>"#,
    )?;
    repo.write("Metadata/a.xml", r#"<Groups><xi:include href="b.xml"/></Groups>"#)?;
    repo.write("Metadata/b.xml", r#"<Groups><xi:include href="a.xml"/></Groups>"#)?;

    let err = load_snapshot(&repo.options(), 1).unwrap_err();
    assert!(matches!(err, CoreError::RepoLoad(_)));
    assert!(err.to_string().contains("cycle"));
    Ok(())
}

#[test]
fn missing_include_target_fails_the_load() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups><xi:include href="nowhere.xml"/></Groups>"#,
    )?;
    let err = load_snapshot(&repo.options(), 1).unwrap_err();
    assert!(matches!(err, CoreError::RepoLoad(_)));
    Ok(())
}

#[test]
fn default_group_must_be_a_profile() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups><Group name="oops" default="true"/></Groups>"#,
    )?;
    let err = load_snapshot(&repo.options(), 1).unwrap_err();
    assert!(matches!(err, CoreError::RepoLoad(_)));
    Ok(())
}

#[test]
fn conflicting_category_declarations_fail_the_load() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="rhel6" category="os"/>
             <Group name="rhel6" category="arch"/>
           </Groups>"#,
    )?;
    let err = load_snapshot(&repo.options(), 1).unwrap_err();
    assert!(matches!(err, CoreError::RepoLoad(_)));
    Ok(())
}

#[test]
fn bundles_are_named_by_attribute_or_file_stem() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups><Group name="web" profile="true"/></Groups>"#,
    )?;
    repo.write(
        "Bundler/explicit.xml",
        r#"<Bundle name="nginx"><Path name="/etc/nginx.conf"/></Bundle>"#,
    )?;
    repo.write("Bundler/motd.xml", r#"<Bundle><Path name="/etc/motd"/></Bundle>"#)?;

    let snap = load_snapshot(&repo.options(), 1)?;
    assert!(snap.bundles.contains_key("nginx"));
    assert!(snap.bundles.contains_key("motd"));
    Ok(())
}

#[test]
fn probes_load_from_xml_and_plain_scripts() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups><Group name="web" profile="true"/></Groups>"#,
    )?;
    repo.write(
        "Probes/declared.xml",
        r#"<probes>
             <probe name="osinfo" interpreter="/usr/bin/python3">print("group:linux")</probe>
             <Group name="web">
               <probe name="vhosts">ls /etc/nginx/sites-enabled</probe>
             </Group>
           </probes>"#,
    )?;
    repo.write("Probes/kernel", "#!/bin/bash\nuname -r\n")?;

    let snap = load_snapshot(&repo.options(), 1)?;
    assert_eq!(snap.probes.len(), 3);

    let osinfo = snap.probes.iter().find(|p| p.name == "osinfo").unwrap();
    assert_eq!(osinfo.interpreter, "/usr/bin/python3");
    assert!(osinfo.groups.is_empty());

    let vhosts = snap.probes.iter().find(|p| p.name == "vhosts").unwrap();
    assert_eq!(vhosts.groups, vec!["web".to_string()]);

    let kernel = snap.probes.iter().find(|p| p.name == "kernel").unwrap();
    assert_eq!(kernel.interpreter, "/bin/bash");
    assert!(kernel.script.contains("uname -r"));
    Ok(())
}

#[test]
fn failed_reload_degrades_and_keeps_the_previous_snapshot() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups><Group name="web" profile="true"/></Groups>"#,
    )?;

    let core = Core::new(repo.options(), Arc::new(NoReverseResolver))
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    assert!(core.snapshot().groups.get("web").is_some());

    // Corrupt the repository; the reload must not take.
    repo.write("Metadata/groups.xml", "<Groups><Group name=")?;
    core.reload();
    assert!(core.is_degraded());
    assert!(core.snapshot().groups.get("web").is_some());

    // Repair it; the next reload publishes a fresh snapshot.
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="web" profile="true"/>
             <Group name="db" profile="true"/>
           </Groups>"#,
    )?;
    core.reload();
    assert!(!core.is_degraded());
    assert!(core.snapshot().groups.get("db").is_some());
    assert_eq!(core.snapshot().generation, 2);
    Ok(())
}

#[test]
fn rules_files_register_in_sorted_filename_order() -> Result<()> {
    let repo = RepoFixture::new()?;
    repo.write(
        "Metadata/groups.xml",
        r#"<Groups><Group name="web" profile="true"/></Groups>"#,
    )?;
    repo.write("Rules/20-b.xml", r#"<Rules priority="5"/>"#)?;
    repo.write("Rules/10-a.xml", r#"<Rules priority="5"/>"#)?;

    let snap = load_snapshot(&repo.options(), 1)?;
    let sources: Vec<&str> = snap.rules.iter().map(|r| r.source.as_str()).collect();
    assert_eq!(sources, vec!["10-a.xml", "20-b.xml"]);
    Ok(())
}
