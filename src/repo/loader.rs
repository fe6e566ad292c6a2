use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;

use crate::binder::rules::{RuleSet, parse_rules_document};
use crate::decision::{DecisionLists, parse_decision_document};
use crate::error::CoreError;
use crate::model::{ClientDecl, Conditional, GroupAssign, GroupDef, Predicate};
use crate::options::ServerOptions;
use crate::probes::{DEFAULT_INTERPRETER, ProbeDef};
use crate::xml::{Element, load_xml_file};

use super::snapshot::{GroupGraph, RepoSnapshot};

const METADATA_DIR: &str = "Metadata";
const BUNDLER_DIR: &str = "Bundler";
const RULES_DIR: &str = "Rules";
const PROBES_DIR: &str = "Probes";
const DECISIONS_DIR: &str = "Decisions";

/// Parse the whole repository into an immutable snapshot. Any failure
/// is fatal for the load; the caller decides whether to keep serving a
/// previous snapshot.
pub fn load_snapshot(options: &ServerOptions, generation: u64) -> Result<RepoSnapshot, CoreError> {
    let root = options.repository.as_path();

    let groups_path = root.join(METADATA_DIR).join("groups.xml");
    let groups_el = load_xml_file(&groups_path)
        .map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
    let (defs, conditionals) = parse_groups(&groups_el)?;
    let groups = GroupGraph::build(defs, conditionals)?;

    let clients_path = root.join(METADATA_DIR).join("clients.xml");
    let clients = if clients_path.exists() {
        let el = load_xml_file(&clients_path)
            .map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
        parse_clients(&el)?
    } else {
        BTreeMap::new()
    };

    let bundles = load_bundles(&root.join(BUNDLER_DIR))?;
    let rules = load_rules(&root.join(RULES_DIR), options.regex_rules)?;
    let probes = load_probes(&root.join(PROBES_DIR))?;
    let decisions = load_decisions(&root.join(DECISIONS_DIR))?;

    Ok(RepoSnapshot {
        generation,
        groups,
        clients,
        bundles,
        rules,
        probes,
        decisions,
    })
}

fn parse_groups(root: &Element) -> Result<(Vec<GroupDef>, Vec<Conditional>), CoreError> {
    let mut defs: BTreeMap<String, GroupDef> = BTreeMap::new();
    let mut conditionals = Vec::new();

    for child in &root.children {
        match child.name.as_str() {
            "Group" => parse_group_element(child, &mut defs, &mut conditionals)?,
            "Client" => {
                let name = require_name(child, "Client")?;
                let body = parse_conditional_body(child, &mut defs)?;
                conditionals.push(Conditional {
                    predicate: Predicate::Client {
                        name,
                        negate: child.bool_attr("negate"),
                    },
                    groups: body.groups,
                    bundles: body.bundles,
                    nested: body.nested,
                });
            }
            other => {
                tracing::debug!(element = other, "ignoring unknown element in groups.xml");
            }
        }
    }

    Ok((defs.into_values().collect(), conditionals))
}

fn parse_group_element(
    el: &Element,
    defs: &mut BTreeMap<String, GroupDef>,
    conditionals: &mut Vec<Conditional>,
) -> Result<(), CoreError> {
    let name = require_name(el, "Group")?;
    merge_group_attrs(&name, el, defs)?;

    for child in &el.children {
        match child.name.as_str() {
            "Bundle" => {
                let bundle = require_name(child, "Bundle")?;
                defs.get_mut(&name).expect("definition just merged").bundles.push(bundle);
            }
            "Group" if child.children.is_empty() => {
                let member = require_name(child, "Group")?;
                merge_group_attrs(&member, child, defs)?;
                if child.bool_attr("negate") {
                    conditionals.push(Conditional {
                        predicate: Predicate::Group {
                            name: name.clone(),
                            negate: false,
                        },
                        groups: vec![GroupAssign {
                            name: member,
                            negate: true,
                        }],
                        bundles: Vec::new(),
                        nested: Vec::new(),
                    });
                } else {
                    defs.get_mut(&name).expect("definition just merged").includes.push(member);
                }
            }
            "Group" | "Client" => {
                let nested = parse_nested_conditional(child, defs)?;
                conditionals.push(Conditional {
                    predicate: Predicate::Group {
                        name: name.clone(),
                        negate: false,
                    },
                    groups: Vec::new(),
                    bundles: Vec::new(),
                    nested: vec![nested],
                });
            }
            other => {
                tracing::debug!(element = other, group = %name, "ignoring unknown group child");
            }
        }
    }

    Ok(())
}

struct ConditionalBody {
    groups: Vec<GroupAssign>,
    bundles: Vec<String>,
    nested: Vec<Conditional>,
}

fn parse_conditional_body(
    el: &Element,
    defs: &mut BTreeMap<String, GroupDef>,
) -> Result<ConditionalBody, CoreError> {
    let mut body = ConditionalBody {
        groups: Vec::new(),
        bundles: Vec::new(),
        nested: Vec::new(),
    };

    for child in &el.children {
        match child.name.as_str() {
            "Bundle" => body.bundles.push(require_name(child, "Bundle")?),
            "Group" if child.children.is_empty() => {
                let member = require_name(child, "Group")?;
                merge_group_attrs(&member, child, defs)?;
                body.groups.push(GroupAssign {
                    name: member,
                    negate: child.bool_attr("negate"),
                });
            }
            "Group" | "Client" => {
                body.nested.push(parse_nested_conditional(child, defs)?);
            }
            other => {
                tracing::debug!(element = other, "ignoring unknown conditional child");
            }
        }
    }

    Ok(body)
}

fn parse_nested_conditional(
    el: &Element,
    defs: &mut BTreeMap<String, GroupDef>,
) -> Result<Conditional, CoreError> {
    let name = require_name(el, &el.name)?;
    let predicate = match el.name.as_str() {
        "Group" => {
            merge_group_attrs(&name, el, defs)?;
            Predicate::Group {
                name,
                negate: el.bool_attr("negate"),
            }
        }
        _ => Predicate::Client {
            name,
            negate: el.bool_attr("negate"),
        },
    };
    let body = parse_conditional_body(el, defs)?;
    Ok(Conditional {
        predicate,
        groups: body.groups,
        bundles: body.bundles,
        nested: body.nested,
    })
}

/// Group attributes may appear on any occurrence of the group's tag;
/// they accumulate into one definition.
fn merge_group_attrs(
    name: &str,
    el: &Element,
    defs: &mut BTreeMap<String, GroupDef>,
) -> Result<(), CoreError> {
    let def = defs.entry(name.to_string()).or_insert_with(|| GroupDef {
        name: name.to_string(),
        ..GroupDef::default()
    });
    def.profile |= el.bool_attr("profile");
    def.public |= el.bool_attr("public");
    def.default |= el.bool_attr("default");
    if let Some(category) = el.attr("category") {
        if let Some(existing) = &def.category {
            if existing != category {
                return Err(CoreError::RepoLoad(format!(
                    "group {name} declared in two categories ({existing}, {category})"
                )));
            }
        }
        def.category = Some(category.to_string());
    }
    Ok(())
}

fn require_name(el: &Element, what: &str) -> Result<String, CoreError> {
    el.attr("name")
        .map(str::to_string)
        .ok_or_else(|| CoreError::RepoLoad(format!("{what} element without name attribute")))
}

fn parse_clients(root: &Element) -> Result<BTreeMap<String, ClientDecl>, CoreError> {
    let mut out = BTreeMap::new();
    for child in root.find_all("Client") {
        let decl = parse_client(child)?;
        if out.insert(decl.name.clone(), decl).is_some() {
            return Err(CoreError::RepoLoad(
                "duplicate client declaration".to_string(),
            ));
        }
    }
    Ok(out)
}

fn parse_client(el: &Element) -> Result<ClientDecl, CoreError> {
    let mut decl = ClientDecl::new(require_name(el, "Client")?);
    decl.profile = el.attr("profile").map(str::to_string);
    decl.uuid = el.attr("uuid").map(str::to_string);
    decl.password = el.attr("password").map(str::to_string);
    decl.secure = el.bool_attr("secure");
    if el.attr("floating").is_some() {
        decl.floating = el.bool_attr("floating");
    }
    decl.version = el.attr("version").map(str::to_string);
    if let Some(address) = el.attr("address") {
        decl.addresses.insert(parse_address(&decl.name, address)?);
    }

    for child in &el.children {
        match child.name.as_str() {
            "Alias" => {
                if let Some(alias) = child.attr("name") {
                    decl.aliases.insert(alias.to_string());
                }
                if let Some(address) = child.attr("address") {
                    decl.addresses.insert(parse_address(&decl.name, address)?);
                }
            }
            "Address" => {
                if let Some(address) = child.attr("address") {
                    decl.addresses.insert(parse_address(&decl.name, address)?);
                }
            }
            "Group" => {
                let group = require_name(child, "Group")?;
                decl.declared_groups.push(GroupAssign {
                    name: group,
                    negate: child.bool_attr("negate"),
                });
            }
            other => {
                tracing::debug!(element = other, client = %decl.name, "ignoring client child");
            }
        }
    }

    Ok(decl)
}

fn parse_address(client: &str, raw: &str) -> Result<std::net::IpAddr, CoreError> {
    raw.parse()
        .map_err(|_| CoreError::RepoLoad(format!("client {client}: invalid address {raw:?}")))
}

/// Serialize the client set back into `clients.xml` form. Dynamic
/// registration and `AssertProfile` persist through this.
pub fn clients_document(clients: &BTreeMap<String, ClientDecl>) -> Element {
    let mut root = Element::new("Clients");
    for decl in clients.values() {
        let mut el = Element::new("Client").with_attr("name", decl.name.clone());
        if let Some(profile) = &decl.profile {
            el.attrs.insert("profile".to_string(), profile.clone());
        }
        if let Some(uuid) = &decl.uuid {
            el.attrs.insert("uuid".to_string(), uuid.clone());
        }
        if let Some(password) = &decl.password {
            el.attrs.insert("password".to_string(), password.clone());
        }
        if decl.secure {
            el.attrs.insert("secure".to_string(), "true".to_string());
        }
        if !decl.floating {
            el.attrs.insert("floating".to_string(), "false".to_string());
        }
        if let Some(version) = &decl.version {
            el.attrs.insert("version".to_string(), version.clone());
        }
        for alias in &decl.aliases {
            el.children
                .push(Element::new("Alias").with_attr("name", alias.clone()));
        }
        for address in &decl.addresses {
            el.children
                .push(Element::new("Address").with_attr("address", address.to_string()));
        }
        for group in &decl.declared_groups {
            let mut g = Element::new("Group").with_attr("name", group.name.clone());
            if group.negate {
                g.attrs.insert("negate".to_string(), "true".to_string());
            }
            el.children.push(g);
        }
        root.children.push(el);
    }
    root
}

fn load_bundles(dir: &Path) -> Result<BTreeMap<String, Element>, CoreError> {
    let mut out = BTreeMap::new();
    for path in xml_files(dir)? {
        let el = load_xml_file(&path).map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
        let name = el
            .attr("name")
            .map(str::to_string)
            .or_else(|| file_stem(&path))
            .ok_or_else(|| CoreError::RepoLoad(format!("unnamed bundle at {}", path.display())))?;
        out.insert(name, el);
    }
    Ok(out)
}

fn load_rules(dir: &Path, regex_enabled: bool) -> Result<Vec<RuleSet>, CoreError> {
    let mut out = Vec::new();
    for path in xml_files(dir)? {
        let el = load_xml_file(&path).map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
        let source = file_name(&path);
        out.push(parse_rules_document(&source, &el, regex_enabled)?);
    }
    Ok(out)
}

fn load_probes(dir: &Path) -> Result<Vec<ProbeDef>, CoreError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for path in sorted_files(dir)? {
        if path.extension().is_some_and(|ext| ext == "xml") {
            let el =
                load_xml_file(&path).map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
            collect_probe_elements(&el, &mut Vec::new(), &path, &mut out)?;
        } else {
            // A plain script file: the file name is the probe name and
            // a shebang line selects the interpreter.
            let script = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))
                .map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
            out.push(ProbeDef {
                name: file_name(&path),
                source: "Probes".to_string(),
                interpreter: shebang_interpreter(&script),
                script,
                groups: Vec::new(),
            });
        }
    }
    Ok(out)
}

fn collect_probe_elements(
    el: &Element,
    groups: &mut Vec<String>,
    path: &Path,
    out: &mut Vec<ProbeDef>,
) -> Result<(), CoreError> {
    match el.name.as_str() {
        "Group" => {
            let name = require_name(el, "Group")?;
            groups.push(name);
            for child in &el.children {
                collect_probe_elements(child, groups, path, out)?;
            }
            groups.pop();
        }
        "probe" => {
            let name = el
                .attr("name")
                .map(str::to_string)
                .or_else(|| file_stem(path))
                .ok_or_else(|| {
                    CoreError::RepoLoad(format!("unnamed probe at {}", path.display()))
                })?;
            out.push(ProbeDef {
                name,
                source: el.attr("source").unwrap_or("Probes").to_string(),
                interpreter: el
                    .attr("interpreter")
                    .map(str::to_string)
                    .unwrap_or_else(|| shebang_interpreter(&el.text)),
                script: el.text.clone(),
                groups: groups.clone(),
            });
        }
        _ => {
            for child in &el.children {
                collect_probe_elements(child, groups, path, out)?;
            }
        }
    }
    Ok(())
}

fn shebang_interpreter(script: &str) -> String {
    script
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("#!"))
        .map(|rest| rest.trim().to_string())
        .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string())
}

fn load_decisions(dir: &Path) -> Result<DecisionLists, CoreError> {
    let mut lists = DecisionLists::default();
    let whitelist = dir.join("whitelist.xml");
    if whitelist.exists() {
        let el =
            load_xml_file(&whitelist).map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
        lists.whitelist = parse_decision_document("whitelist.xml", &el)?;
    }
    let blacklist = dir.join("blacklist.xml");
    if blacklist.exists() {
        let el =
            load_xml_file(&blacklist).map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
        lists.blacklist = parse_decision_document("blacklist.xml", &el)?;
    }
    Ok(lists)
}

fn xml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, CoreError> {
    Ok(sorted_files(dir)?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "xml"))
        .collect())
}

/// Deterministic registration order: sorted by file name.
fn sorted_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, CoreError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))
        .map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
    for entry in entries {
        let entry = entry
            .with_context(|| format!("read dir entry in {}", dir.display()))
            .map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Temp-file-and-rename write, used for `clients.xml` updates.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let write = || -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    };
    write().map_err(|err| CoreError::RepoLoad(format!("{:#}", err)))
}
