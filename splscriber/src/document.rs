//! Owned element tree for one SPL label revision.
//!
//! The raw XML is read once with quick-xml's event reader and folded into a small
//! DOM-like tree. Every later stage (registry, extractor, renderer, rescue) walks this
//! tree instead of re-reading or regex-rewriting the XML text.
//!
//! Elements are numbered in document order as they are opened; the number is the
//! element's identity for deduplication across extraction passes.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SplError, SplResult};
use crate::text::collapse_whitespace;

/// A node of the parsed document.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// One XML element with its attributes and children, namespace prefixes removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    /// Position of this element in document order, unique within one document.
    pub index: usize,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Child elements, skipping text nodes.
    pub fn elements(&self) -> impl DoubleEndedIterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |el| el.name == name)
    }

    /// Follow a chain of child element names.
    pub fn path(&self, names: &[&str]) -> Option<&Element> {
        let mut current = self;
        for name in names {
            current = current.child(name)?;
        }
        Some(current)
    }

    /// All descendant elements in document order, excluding `self`.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.elements().rev().collect(),
        }
    }

    pub fn find_descendant(&self, name: &str) -> Option<&Element> {
        self.descendants().find(|el| el.name == name)
    }

    /// Concatenated text of this element and its descendants, whitespace collapsed
    /// and trimmed.
    pub fn text_content(&self) -> String {
        let mut raw = String::new();
        collect_text(self, &mut raw);
        collapse_whitespace(&raw).trim().to_string()
    }
}

fn collect_text(element: &Element, out: &mut String) {
    for child in &element.children {
        match child {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                if el.name == "br" {
                    out.push(' ');
                }
                collect_text(el, out);
            }
        }
    }
}

/// Pre-order iterator over descendant elements.
pub struct Descendants<'a> {
    stack: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<&'a Element> {
        let element = self.stack.pop()?;
        self.stack.extend(element.elements().rev());
        Some(element)
    }
}

/// Accessors for a `<section>` element.
#[derive(Debug, Clone, Copy)]
pub struct SectionElement<'a> {
    pub element: &'a Element,
}

impl<'a> SectionElement<'a> {
    pub fn new(element: &'a Element) -> Self {
        Self { element }
    }

    pub fn index(&self) -> usize {
        self.element.index
    }

    pub fn code(&self) -> Option<&'a str> {
        self.element
            .child("code")
            .and_then(|code| code.attr("code"))
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }

    pub fn display_name(&self) -> Option<&'a str> {
        self.element
            .child("code")
            .and_then(|code| code.attr("displayName"))
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn title(&self) -> Option<String> {
        self.element
            .child("title")
            .map(Element::text_content)
            .filter(|title| !title.is_empty())
    }

    /// The `<text>` body of the section, if any.
    pub fn content(&self) -> Option<&'a Element> {
        self.element.child("text")
    }

    /// Directly nested sections, whether wrapped in `<component>` or not.
    pub fn subsections(&self) -> Vec<&'a Element> {
        let mut out = Vec::new();
        for child in self.element.elements() {
            match child.name.as_str() {
                "section" => out.push(child),
                "component" => out.extend(child.children_named("section")),
                _ => {}
            }
        }
        out
    }
}

/// Descriptive fields read from the document header and product data elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelMetadata {
    pub set_id: Option<String>,
    pub title: Option<String>,
    pub version: Option<String>,
    pub effective_time: Option<String>,
    pub labeler_name: Option<String>,
    pub brand_name: Option<String>,
    pub generic_name: Option<String>,
    pub dosage_forms: Vec<String>,
    pub routes: Vec<String>,
}

/// The parsed XML tree for one label revision. Immutable once built.
#[derive(Debug, Clone)]
pub struct RawLabelDocument {
    root: Element,
    element_count: usize,
}

impl RawLabelDocument {
    /// Parse raw label XML.
    ///
    /// # Errors
    ///
    /// Returns [`SplError::MalformedDocument`] when the text is not well-formed XML or has
    /// no root element. This is the only fatal failure of the pipeline.
    pub fn parse(xml: &str) -> SplResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut next_index = 0usize;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let element = open_element(&e, &mut next_index)?;
                    stack.push(element);
                }
                Ok(Event::Empty(e)) => {
                    let element = open_element(&e, &mut next_index)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        SplError::MalformedDocument("closing tag without an open element".into())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(e)) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = e.unescape_with(resolve_entity)?;
                        push_text(parent, text);
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(parent) = stack.last_mut() {
                        let raw = e.into_inner();
                        push_text(parent, String::from_utf8_lossy(&raw));
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(SplError::MalformedDocument(format!(
                        "error at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(SplError::MalformedDocument(format!(
                "unclosed element <{}>",
                open.name
            )));
        }
        let root =
            root.ok_or_else(|| SplError::MalformedDocument("document has no root element".into()))?;
        if root.name != "document" {
            warn!(root = %root.name, "SPL root element is not <document>");
        }

        Ok(Self {
            root,
            element_count: next_index,
        })
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Every `<section>` element in document order, nested ones included.
    pub fn sections(&self) -> Vec<SectionElement<'_>> {
        self.root
            .descendants()
            .filter(|el| el.name == "section")
            .map(SectionElement::new)
            .collect()
    }

    /// Sections directly under the structured body, in document order.
    pub fn top_level_sections(&self) -> Vec<SectionElement<'_>> {
        match self.root.path(&["component", "structuredBody"]) {
            Some(body) => body
                .children_named("component")
                .flat_map(|component| component.children_named("section"))
                .map(SectionElement::new)
                .collect(),
            None => {
                warn!("SPL document has no structuredBody, scanning all sections");
                let mut nested = std::collections::HashSet::new();
                for section in self.sections() {
                    for sub in section.subsections() {
                        nested.insert(sub.index);
                    }
                }
                self.sections()
                    .into_iter()
                    .filter(|s| !nested.contains(&s.index()))
                    .collect()
            }
        }
    }

    pub fn metadata(&self) -> LabelMetadata {
        let root = &self.root;
        let text_of = |el: Option<&Element>| {
            el.map(Element::text_content).filter(|text| !text.is_empty())
        };
        let attr_of = |el: Option<&Element>, name: &str| {
            el.and_then(|el| el.attr(name))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        // Products with a name are the inner manufacturedProduct of each subject.
        let products: Vec<&Element> = root
            .descendants()
            .filter(|el| el.name == "manufacturedProduct" && el.child("name").is_some())
            .collect();

        let brand_name = products.iter().find_map(|p| text_of(p.child("name")));
        let generic_name = root
            .descendants()
            .filter(|el| el.name == "genericMedicine")
            .find_map(|el| text_of(el.child("name")));

        let mut dosage_forms = Vec::new();
        for product in &products {
            if let Some(form) = attr_of(product.child("formCode"), "displayName") {
                if !dosage_forms.contains(&form) {
                    dosage_forms.push(form);
                }
            }
        }

        let mut routes = Vec::new();
        for route in root.descendants().filter(|el| el.name == "routeCode") {
            if let Some(name) = attr_of(Some(route), "displayName") {
                if !routes.contains(&name) {
                    routes.push(name);
                }
            }
        }

        LabelMetadata {
            set_id: attr_of(root.child("setId"), "root"),
            title: text_of(root.child("title")),
            version: attr_of(root.child("versionNumber"), "value"),
            effective_time: attr_of(root.child("effectiveTime"), "value"),
            labeler_name: text_of(root.path(&[
                "author",
                "assignedEntity",
                "representedOrganization",
                "name",
            ])),
            brand_name,
            generic_name,
            dosage_forms,
            routes,
        }
    }
}

fn open_element(start: &BytesStart<'_>, next_index: &mut usize) -> SplResult<Element> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.push((key, value));
    }

    let index = *next_index;
    *next_index += 1;
    Ok(Element {
        name,
        index,
        attributes,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> SplResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => {
            if root.is_some() {
                return Err(SplError::MalformedDocument(
                    "more than one root element".into(),
                ));
            }
            *root = Some(element);
        }
    }
    Ok(())
}

fn push_text(parent: &mut Element, text: Cow<'_, str>) {
    if let Some(Node::Text(existing)) = parent.children.last_mut() {
        existing.push_str(&text);
    } else {
        parent.children.push(Node::Text(text.into_owned()));
    }
}

/// XML's predefined entities plus the HTML ones that show up in hand-edited labels.
fn resolve_entity(entity: &str) -> Option<&'static str> {
    match entity {
        "lt" => Some("<"),
        "gt" => Some(">"),
        "amp" => Some("&"),
        "apos" => Some("'"),
        "quot" => Some("\""),
        "nbsp" => Some("\u{a0}"),
        "reg" => Some("®"),
        "trade" => Some("™"),
        "copy" => Some("©"),
        "deg" => Some("°"),
        "micro" => Some("µ"),
        "plusmn" => Some("±"),
        "ndash" => Some("–"),
        "mdash" => Some("—"),
        _ => None,
    }
}
