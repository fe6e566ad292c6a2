use crate::binder::registry::StructureSource;
use crate::core::Deadline;
use crate::error::CoreError;
use crate::model::{AbstractEntry, ClientMetadata};
use crate::repo::RepoSnapshot;
use crate::xml::Element;

/// An ordered collection of abstract entries produced for one bundle.
#[derive(Clone, Debug)]
pub struct Structure {
    pub name: String,
    pub entries: Vec<AbstractEntry>,
    pub failure: Option<StructureFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructureFailure {
    /// The bundle is named by the metadata but absent from the
    /// repository.
    Missing,
    Failed(String),
}

impl StructureFailure {
    pub fn to_element(&self) -> Element {
        match self {
            StructureFailure::Missing => Element::new("error").with_attr("kind", "missing"),
            StructureFailure::Failed(message) => Element::new("error")
                .with_attr("kind", "failed")
                .with_text(message.clone()),
        }
    }
}

/// Renders a bundle fragment against frozen client metadata. Rendering
/// happens at assembly time, never at parse time.
pub trait BundleTemplate: Send + Sync {
    fn render(&self, metadata: &ClientMetadata, fragment: &Element) -> Result<Element, CoreError>;
}

/// Substitutes `@{hostname}`, `@{profile}` and `@{uuid}` placeholders
/// in attribute values and text content.
pub struct PlaceholderTemplate;

impl BundleTemplate for PlaceholderTemplate {
    fn render(&self, metadata: &ClientMetadata, fragment: &Element) -> Result<Element, CoreError> {
        let mut out = fragment.clone();
        substitute(&mut out, metadata);
        Ok(out)
    }
}

fn substitute(el: &mut Element, metadata: &ClientMetadata) {
    for value in el.attrs.values_mut() {
        *value = render_text(value, metadata);
    }
    el.text = render_text(&el.text, metadata);
    for child in &mut el.children {
        substitute(child, metadata);
    }
}

fn render_text(input: &str, metadata: &ClientMetadata) -> String {
    if !input.contains("@{") {
        return input.to_string();
    }
    input
        .replace("@{hostname}", &metadata.hostname)
        .replace("@{profile}", metadata.profile.as_deref().unwrap_or(""))
        .replace("@{uuid}", metadata.uuid.as_deref().unwrap_or(""))
}

/// The built-in bundle source: expands `metadata.bundles` into
/// structures, rendering templates and flattening conditional nesting
/// against the client's group membership.
pub struct BundlerSource {
    template: Box<dyn BundleTemplate>,
}

impl BundlerSource {
    pub fn new() -> Self {
        BundlerSource {
            template: Box::new(PlaceholderTemplate),
        }
    }

    pub fn with_template(template: Box<dyn BundleTemplate>) -> Self {
        BundlerSource { template }
    }
}

impl Default for BundlerSource {
    fn default() -> Self {
        BundlerSource::new()
    }
}

impl StructureSource for BundlerSource {
    fn name(&self) -> &str {
        "Bundler"
    }

    fn assemble(
        &self,
        snap: &RepoSnapshot,
        metadata: &ClientMetadata,
        deadline: &Deadline,
    ) -> Result<Vec<Structure>, CoreError> {
        let mut out = Vec::with_capacity(metadata.bundles.len());
        for bundle in &metadata.bundles {
            deadline.check()?;

            let Some(fragment) = snap.bundles.get(bundle) else {
                tracing::warn!(bundle, "bundle named by metadata is missing");
                out.push(Structure {
                    name: bundle.clone(),
                    entries: Vec::new(),
                    failure: Some(StructureFailure::Missing),
                });
                continue;
            };

            let rendered = match self.template.render(metadata, fragment) {
                Ok(rendered) => rendered,
                Err(err) => {
                    out.push(Structure {
                        name: bundle.clone(),
                        entries: Vec::new(),
                        failure: Some(StructureFailure::Failed(err.to_string())),
                    });
                    continue;
                }
            };

            let mut entries = Vec::new();
            flatten_entries(&rendered, metadata, &mut entries);
            out.push(Structure {
                name: bundle.clone(),
                entries,
                failure: None,
            });
        }
        Ok(out)
    }
}

/// Walk a bundle fragment, descending into `<Group>`/`<Client>`
/// conditionals whose predicate holds and collecting entry elements.
fn flatten_entries(el: &Element, metadata: &ClientMetadata, out: &mut Vec<AbstractEntry>) {
    for child in &el.children {
        match child.name.as_str() {
            "Group" => {
                if let Some(name) = child.attr("name") {
                    if metadata.group_predicate(name, child.bool_attr("negate")) {
                        flatten_entries(child, metadata, out);
                    }
                }
            }
            "Client" => {
                if let Some(name) = child.attr("name") {
                    if metadata.client_predicate(name, child.bool_attr("negate")) {
                        flatten_entries(child, metadata, out);
                    }
                }
            }
            _ => {
                if let Some(entry) = AbstractEntry::from_element(child) {
                    out.push(entry);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn metadata_with_groups(groups: &[&str]) -> ClientMetadata {
        ClientMetadata {
            hostname: "c1.example.com".to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect::<BTreeSet<_>>(),
            ..ClientMetadata::default()
        }
    }

    #[test]
    fn conditionals_flatten_against_membership() {
        let fragment = Element::parse(
            r#"<Bundle name="web">
                 <Path name="/etc/httpd.conf"/>
                 <Group name="ssl"><Path name="/etc/ssl.conf"/></Group>
                 <Group name="ssl" negate="true"><Path name="/etc/nossl.conf"/></Group>
               </Bundle>"#,
        )
        .unwrap();

        let metadata = metadata_with_groups(&["web", "ssl"]);
        let mut entries = Vec::new();
        flatten_entries(&fragment, &metadata, &mut entries);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["/etc/httpd.conf", "/etc/ssl.conf"]);
    }

    #[test]
    fn placeholders_render_at_assembly_time() {
        let fragment = Element::parse(
            r#"<Bundle name="motd"><BoundPath name="/etc/motd">welcome to @{hostname}</BoundPath></Bundle>"#,
        )
        .unwrap();

        let metadata = metadata_with_groups(&[]);
        let rendered = PlaceholderTemplate.render(&metadata, &fragment).unwrap();
        assert_eq!(rendered.children[0].text, "welcome to c1.example.com");
    }
}
