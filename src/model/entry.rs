use std::collections::BTreeMap;

use crate::xml::Element;

const BOUND_PREFIX: &str = "Bound";

/// A declared configuration requirement from a bundle. Bound entries
/// (`BoundPath`, `BoundService`, …) already carry their literal
/// attributes and bypass the binder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbstractEntry {
    pub kind: String,
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub bound: bool,
}

impl AbstractEntry {
    /// `None` for elements that are not entries (no `name` attribute).
    pub fn from_element(el: &Element) -> Option<Self> {
        let name = el.attr("name")?.to_string();
        let (kind, bound) = match el.name.strip_prefix(BOUND_PREFIX) {
            Some(base) if !base.is_empty() => (base.to_string(), true),
            _ => (el.name.clone(), false),
        };
        let mut attrs = el.attrs.clone();
        attrs.remove("name");
        Some(AbstractEntry {
            kind,
            name,
            attrs,
            text: el.text.clone(),
            bound,
        })
    }
}

/// A fully concrete configuration item ready for client consumption, or
/// an `<error>` element standing in for one that could not be produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiteralEntry {
    pub kind: String,
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
}

impl LiteralEntry {
    /// In-place error entry; `kind` records the abstract kind that
    /// failed to bind.
    pub fn error(kind: &str, name: &str, failure: &str) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert("kind".to_string(), kind.to_string());
        attrs.insert("failure".to_string(), failure.to_string());
        LiteralEntry {
            kind: "error".to_string(),
            name: name.to_string(),
            attrs,
            text: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new(self.kind.clone()).with_attr("name", self.name.clone());
        for (key, value) in &self.attrs {
            el.attrs.insert(key.clone(), value.clone());
        }
        el.text = self.text.clone();
        el
    }
}
