//! SPL narrative markup → display HTML.
//!
//! One recursive walk over a section's `<text>` element writes sanitized HTML into a
//! buffer. Only whitelisted tags and attributes are emitted, all text is escaped, and
//! every media reference becomes a concrete `<img>` wrapper, so the output never contains
//! SPL media markup. The walk reads nothing but the element tree and the registry, which
//! makes rendering the same node twice byte-identical.
//!
//! ## Mapping
//!
//! | SPL | HTML |
//! | --- | --- |
//! | `paragraph` | `p` |
//! | `list` / `item` | `ol` when `listType="ordered"`, else `ul` / `li` |
//! | `content styleCode="bold italics underline"` | nested `strong`, `em`, `u` |
//! | `table`, `thead`, `tbody`, `tfoot`, `tr`, `th`, `td` | same, `colspan`/`rowspan` kept |
//! | `renderMultiMedia`, inline `observationMedia` | image wrapper resolved through the registry |
//! | `linkHtml` | `a` (internal anchors, http(s), mailto only) |

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::document::{Element, Node};
use crate::images::{ImageRegistry, ImageResolution};
use crate::loinc::base_key;
use crate::text::{collapse_whitespace, escape_attr, escape_text};

/// Hide the image if both the primary and the alternate URL fail.
const IMAGE_ONERROR: &str = "if(this.dataset.altSrc&&this.src!==this.dataset.altSrc){this.src=this.dataset.altSrc}else{this.style.display='none'}";

static FIGURE_CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:figure|fig\.?)\s*(\d{1,3})\b").unwrap());

static FIGURE_IN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)fig(?:ure)?[\s_.\-]*0*(\d{1,3})").unwrap());

/// Figure number carried by an image name, id or caption (`lantus-fig-03` → 3).
pub fn figure_number(text: &str) -> Option<u32> {
    FIGURE_IN_NAME
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Rendered section body plus the registry ids it displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedHtml {
    pub html: String,
    pub image_refs: Vec<String>,
}

/// Render a section's content node to HTML.
pub fn render_section_html(
    content: &Element,
    set_id: &str,
    section_key: &str,
    registry: &ImageRegistry,
) -> String {
    render_section(content, set_id, section_key, registry).html
}

/// Render a section's content node, also reporting which registry images it uses.
///
/// `set_id` keys the URLs synthesized for references the registry cannot resolve.
pub fn render_section(
    content: &Element,
    set_id: &str,
    section_key: &str,
    registry: &ImageRegistry,
) -> RenderedHtml {
    let mut renderer = Renderer {
        registry,
        set_id,
        instructions: base_key(section_key) == "instructionsForUse",
        out: String::new(),
        image_refs: Vec::new(),
        cited_figures: BTreeSet::new(),
    };
    renderer.children(content, true);
    renderer.append_missing_figures();

    RenderedHtml {
        html: renderer.out.trim().to_string(),
        image_refs: renderer.image_refs,
    }
}

struct Renderer<'a> {
    registry: &'a ImageRegistry,
    set_id: &'a str,
    instructions: bool,
    out: String,
    image_refs: Vec<String>,
    cited_figures: BTreeSet<u32>,
}

impl Renderer<'_> {
    /// Render children into the main buffer. Whitespace-only text between blocks is
    /// dropped when `block` is set.
    fn children(&mut self, element: &Element, block: bool) {
        for child in &element.children {
            match child {
                Node::Text(text) => self.text(text, block),
                Node::Element(el) => self.element(el, element),
            }
        }
    }

    /// Render children into a fresh string, trimmed.
    fn inner(&mut self, element: &Element, block: bool) -> String {
        let saved = std::mem::take(&mut self.out);
        self.children(element, block);
        let inner = std::mem::replace(&mut self.out, saved);
        inner.trim().to_string()
    }

    fn text(&mut self, text: &str, block: bool) {
        if block && text.trim().is_empty() {
            return;
        }
        for caps in FIGURE_CITATION.captures_iter(text) {
            if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                self.cited_figures.insert(n);
            }
        }
        self.out.push_str(&escape_text(&collapse_whitespace(text)));
    }

    fn element(&mut self, el: &Element, parent: &Element) {
        match el.name.as_str() {
            "paragraph" => {
                let inner = self.inner(el, false);
                if !inner.is_empty() {
                    self.out.push_str("<p>");
                    self.out.push_str(&inner);
                    self.out.push_str("</p>");
                }
            }
            "list" => self.list(el),
            "item" => {
                let inner = self.inner(el, false);
                self.out.push_str("<li>");
                self.out.push_str(&inner);
                self.out.push_str("</li>");
            }
            "caption" => self.caption(el, parent),
            "content" => self.styled(el),
            "sup" | "sub" => {
                let inner = self.inner(el, false);
                self.out.push_str(&format!("<{0}>{1}</{0}>", el.name, inner));
            }
            "br" => self.out.push_str("<br/>"),
            "table" => {
                self.out.push_str("<table class=\"spl-table\">");
                self.children(el, true);
                self.out.push_str("</table>");
            }
            "thead" | "tbody" | "tfoot" | "tr" => {
                self.out.push_str(&format!("<{}>", el.name));
                self.children(el, true);
                self.out.push_str(&format!("</{}>", el.name));
            }
            "th" | "td" => {
                let inner = self.inner(el, false);
                self.out.push('<');
                self.out.push_str(&el.name);
                for attr in ["colspan", "rowspan"] {
                    if let Some(span) = span_attr(el, attr) {
                        self.out.push_str(&format!(" {attr}=\"{span}\""));
                    }
                }
                self.out.push('>');
                self.out.push_str(&inner);
                self.out.push_str(&format!("</{}>", el.name));
            }
            "colgroup" => {
                self.out.push_str("<colgroup");
                if let Some(span) = span_attr(el, "span") {
                    self.out.push_str(&format!(" span=\"{span}\""));
                }
                self.out.push('>');
                self.children(el, true);
                self.out.push_str("</colgroup>");
            }
            "col" => match span_attr(el, "span") {
                Some(span) => self.out.push_str(&format!("<col span=\"{span}\"/>")),
                None => self.out.push_str("<col/>"),
            },
            "renderMultiMedia" => {
                let id = el.attr("referencedObject").unwrap_or_default();
                let caption = el
                    .child("caption")
                    .map(Element::text_content)
                    .filter(|c| !c.is_empty());
                if id.trim().is_empty() {
                    return;
                }
                self.image(id, None, caption);
            }
            "observationMedia" => {
                let reference = el
                    .path(&["value", "reference"])
                    .and_then(|r| r.attr("value"));
                let id = el.attr("ID").or(reference).unwrap_or_default();
                if id.trim().is_empty() {
                    return;
                }
                let caption = el
                    .child("text")
                    .map(Element::text_content)
                    .filter(|c| !c.is_empty());
                self.image(id, reference, caption);
            }
            "linkHtml" => self.link(el),
            "footnote" => {
                let inner = self.inner(el, false);
                self.out.push_str("<span class=\"spl-footnote\">");
                self.out.push_str(&inner);
                self.out.push_str("</span>");
            }
            // Structural or summary markup that has no place in the body.
            "footnoteRef" | "code" | "id" | "effectiveTime" | "section" | "excerpt"
            | "highlight" | "subject" | "title" => {}
            _ => self.children(el, false),
        }
    }

    fn list(&mut self, el: &Element) {
        let ordered = el
            .attr("listType")
            .is_some_and(|t| t.eq_ignore_ascii_case("ordered"));
        let tag = if ordered { "ol" } else { "ul" };

        if let Some(caption) = el.child("caption") {
            let inner = self.inner(caption, false);
            if !inner.is_empty() {
                self.out.push_str("<p class=\"spl-list-caption\">");
                self.out.push_str(&inner);
                self.out.push_str("</p>");
            }
        }

        self.out.push_str(&format!("<{tag}>"));
        for child in &el.children {
            match child {
                Node::Element(item) if item.name == "item" => self.element(item, el),
                Node::Element(other) if other.name == "caption" => {}
                Node::Element(other) => {
                    let inner = self.inner(other, false);
                    if !inner.is_empty() {
                        self.out.push_str("<li>");
                        self.out.push_str(&inner);
                        self.out.push_str("</li>");
                    }
                }
                Node::Text(text) if text.trim().is_empty() => {}
                Node::Text(text) => {
                    self.out.push_str("<li>");
                    self.text(text, false);
                    self.out.push_str("</li>");
                }
            }
        }
        self.out.push_str(&format!("</{tag}>"));
    }

    fn caption(&mut self, el: &Element, parent: &Element) {
        let inner = self.inner(el, false);
        if inner.is_empty() {
            return;
        }
        match parent.name.as_str() {
            "table" => {
                self.out.push_str("<caption>");
                self.out.push_str(&inner);
                self.out.push_str("</caption>");
            }
            // List captions are written by `list` ahead of the list element.
            "list" => {}
            _ => {
                self.out.push_str("<span class=\"spl-caption\">");
                self.out.push_str(&inner);
                self.out.push_str("</span> ");
            }
        }
    }

    fn styled(&mut self, el: &Element) {
        let mut tags: Vec<&str> = Vec::new();
        for style in el.attr("styleCode").unwrap_or_default().split_whitespace() {
            let tag = match style.to_ascii_lowercase().as_str() {
                "bold" => "strong",
                "italics" | "italic" | "emphasis" => "em",
                "underline" => "u",
                _ => continue,
            };
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        if tags.is_empty() {
            self.children(el, false);
            return;
        }
        for tag in &tags {
            self.out.push_str(&format!("<{tag}>"));
        }
        self.children(el, false);
        for tag in tags.iter().rev() {
            self.out.push_str(&format!("</{tag}>"));
        }
    }

    fn link(&mut self, el: &Element) {
        let href = el.attr("href").map(str::trim).unwrap_or_default();
        let inner = self.inner(el, false);

        if let Some(target) = href.strip_prefix('#').filter(|t| !t.is_empty()) {
            if self.registry.contains(target) {
                self.out.push_str(&format!(
                    "<a href=\"#{0}\" class=\"spl-image-link\" data-image-ref=\"{0}\">",
                    escape_attr(target)
                ));
                self.push_image_ref(target);
            } else {
                self.out
                    .push_str(&format!("<a href=\"#{}\">", escape_attr(target)));
            }
        } else if is_safe_external(href) {
            self.out.push_str(&format!(
                "<a href=\"{}\" rel=\"noopener noreferrer\" target=\"_blank\">",
                escape_attr(href)
            ));
        } else {
            self.out.push_str(&inner);
            return;
        }
        self.out.push_str(&inner);
        self.out.push_str("</a>");
    }

    fn image(&mut self, id: &str, raw_fragment: Option<&str>, caption: Option<String>) {
        let registry = self.registry;
        let id = id.trim().trim_start_matches('#');
        let resolution = registry.resolve(id, raw_fragment);

        let (ref_id, src, alt_src, caption, fallback) = match &resolution {
            ImageResolution::Registered { record, .. } => (
                record.id.clone(),
                record.url.clone(),
                record.alternate_url.clone(),
                caption.or_else(|| record.caption.clone()),
                false,
            ),
            ImageResolution::Fallback { name, .. } => {
                let urls = registry.urls();
                (
                    id.to_string(),
                    urls.primary(name, self.set_id),
                    urls.alternate(name, self.set_id),
                    caption,
                    true,
                )
            }
        };

        if !fallback {
            self.push_image_ref(&ref_id);
        }
        self.write_image(&ref_id, &src, &alt_src, caption.as_deref(), fallback);
    }

    fn write_image(&mut self, id: &str, src: &str, alt_src: &str, caption: Option<&str>, fallback: bool) {
        let mut class = String::from("spl-image");
        if self.instructions {
            class.push_str(" spl-ifu-figure");
        }
        if fallback {
            class.push_str(" spl-image-fallback");
        }
        let alt = caption.unwrap_or(id);

        self.out.push_str(&format!(
            "<span class=\"{class}\" data-image-ref=\"{}\"",
            escape_attr(id)
        ));
        if fallback {
            self.out.push_str(" data-fallback=\"true\"");
        }
        self.out.push_str(&format!(
            "><img src=\"{}\" alt=\"{}\" data-alt-src=\"{}\" loading=\"lazy\" onerror=\"{}\"/>",
            escape_attr(src),
            escape_attr(alt),
            escape_attr(alt_src),
            escape_attr(IMAGE_ONERROR)
        ));
        if let Some(caption) = caption {
            self.out.push_str(&format!(
                "<span class=\"spl-image-caption\">{}</span>",
                escape_text(caption)
            ));
        }
        self.out.push_str("</span>");
    }

    fn push_image_ref(&mut self, id: &str) {
        if !self.image_refs.iter().any(|r| r == id) {
            self.image_refs.push(id.to_string());
        }
    }

    /// Cited figure numbers that no section of the document links to get an image
    /// synthesized from the number.
    fn append_missing_figures(&mut self) {
        let missing: Vec<u32> = self
            .cited_figures
            .difference(self.registry.linked_figures())
            .copied()
            .collect();
        if missing.is_empty() {
            return;
        }

        let registry = self.registry;
        self.out.push_str("<div class=\"spl-figure-references\">");
        for n in missing {
            let presumed_id = format!("figure-{n}");
            let caption = Some(format!("Figure {n}"));
            match registry.find_figure(n) {
                Some(record) => {
                    let (id, url, alt) =
                        (record.id.clone(), record.url.clone(), record.alternate_url.clone());
                    let caption = record.caption.clone().or(caption);
                    self.push_image_ref(&id);
                    self.write_image(&id, &url, &alt, caption.as_deref(), false);
                }
                None => match registry.resolve(&presumed_id, None) {
                    ImageResolution::Registered { record, .. } => {
                        let (id, url, alt) =
                            (record.id.clone(), record.url.clone(), record.alternate_url.clone());
                        self.push_image_ref(&id);
                        self.write_image(&id, &url, &alt, caption.as_deref(), false);
                    }
                    ImageResolution::Fallback { name, .. } => {
                        let urls = registry.urls();
                        let (url, alt) = (urls.primary(&name, self.set_id), urls.alternate(&name, self.set_id));
                        self.write_image(&presumed_id, &url, &alt, caption.as_deref(), true);
                    }
                },
            }
        }
        self.out.push_str("</div>");
    }
}

fn span_attr(el: &Element, name: &str) -> Option<u32> {
    el.attr(name)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|n| *n > 1 || name == "span")
}

fn is_safe_external(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("mailto:")
}
