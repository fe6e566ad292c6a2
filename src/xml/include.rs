use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};

use super::Element;

/// Load an XML document and expand cross-document inclusion.
///
/// Any element whose local name is `include` (e.g. `<xi:include>`) is
/// replaced by the referenced document's root children, recursively.
/// References resolve relative to the including file. A file appearing
/// twice on the current inclusion stack is a cycle and fails the load;
/// diamond inclusion through disjoint branches is allowed.
pub fn load_xml_file(path: &Path) -> Result<Element> {
    let mut stack = Vec::new();
    load_inner(path, &mut stack)
}

fn load_inner(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Element> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("resolve {}", path.display()))?;
    if stack.contains(&canonical) {
        bail!("inclusion cycle at {}", path.display());
    }
    stack.push(canonical);

    let text =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut root =
        Element::parse(&text).with_context(|| format!("parse {}", path.display()))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    expand_includes(&mut root, dir, stack)?;

    stack.pop();
    Ok(root)
}

fn expand_includes(el: &mut Element, dir: &Path, stack: &mut Vec<PathBuf>) -> Result<()> {
    let mut expanded = Vec::with_capacity(el.children.len());
    for mut child in el.children.drain(..) {
        if child.local_name() == "include" {
            let href = child
                .attr("href")
                .ok_or_else(|| anyhow!("include element without href"))?;
            let sub = load_inner(&dir.join(href), stack)
                .with_context(|| format!("include {}", href))?;
            expanded.extend(sub.children);
        } else {
            expand_includes(&mut child, dir, stack)?;
            expanded.push(child);
        }
    }
    el.children = expanded;
    Ok(())
}
