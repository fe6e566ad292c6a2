use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use quick_xml::Reader;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

/// Owned XML element tree.
///
/// Attributes live in a `BTreeMap`, so serializing the same tree twice
/// yields byte-identical output regardless of the attribute order in the
/// source document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ..Element::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Attribute interpreted as a boolean; `true`, `yes` and `1` count.
    pub fn bool_attr(&self, key: &str) -> bool {
        matches!(self.attr(key), Some("true") | Some("yes") | Some("1"))
    }

    /// Tag name without a namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn parse(input: &str) -> Result<Element> {
        let mut reader = Reader::from_str(input);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event().context("read xml event")? {
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let el = element_from_start(&start)?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| anyhow!("unbalanced closing tag"))?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text.unescape().context("unescape text")?);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                // Declarations, comments and processing instructions carry
                // nothing the synthesis pipeline consumes.
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(anyhow!("unexpected end of document"));
        }
        root.ok_or_else(|| anyhow!("document has no root element"))
    }

    /// Canonical serialization: sorted attributes, document-order
    /// children, no indentation, no XML declaration.
    pub fn to_xml(&self) -> String {
        let mut buf = Vec::new();
        let mut writer = quick_xml::Writer::new(&mut buf);
        // Writing into a Vec cannot fail.
        let _ = self.write_into(&mut writer);
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn write_into(&self, writer: &mut quick_xml::Writer<&mut Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attrs {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.text.is_empty() && self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        if !self.text.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&self.text)))?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut el = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.context("read attribute")?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().context("unescape attribute")?;
        el.attrs.insert(key, value.into_owned());
    }
    Ok(el)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(el);
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(anyhow!("multiple root elements"));
            }
            *root = Some(el);
            Ok(())
        }
    }
}
