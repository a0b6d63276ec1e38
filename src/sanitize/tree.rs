//! Owned, immutable markup tree used by the sanitizer, with deterministic serialization.

use scraper::ElementRef;

const VOID_TAGS: &[&str] = &["br", "hr", "img"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    /// Sorted by name.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: &str, attrs: Vec<(String, String)>, children: Vec<Node>) -> Self {
        let mut attrs = attrs;
        attrs.sort();
        Self {
            tag: tag.to_string(),
            attrs,
            children,
        }
    }

    /// Copy a parsed element (and its subtree) out of a `scraper` document. Comments and
    /// processing instructions are dropped.
    pub fn from_element_ref(el: ElementRef<'_>) -> Self {
        let value = el.value();
        let attrs = value
            .attrs()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect();
        let children = el
            .children()
            .filter_map(|child| match child.value() {
                scraper::Node::Text(t) => Some(Node::Text(t.text.to_string())),
                scraper::Node::Element(_) => {
                    ElementRef::wrap(child).map(|e| Node::Element(Element::from_element_ref(e)))
                }
                _ => None,
            })
            .collect();
        Element::new(&value.name().to_ascii_lowercase(), attrs, children)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whitespace-separated tokens of the `class` attribute.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }

    pub fn is_void(&self) -> bool {
        VOID_TAGS.contains(&self.tag.as_str())
    }
}

impl Node {
    pub fn element(&self) -> Option<&Element> {
        match self {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        }
    }

    pub fn is_tag(&self, tag: &str) -> bool {
        self.element().is_some_and(|e| e.tag == tag)
    }
}

/// Concatenated text of a subtree.
pub fn text_of(nodes: &[Node]) -> String {
    let mut out = String::new();
    collect_text(nodes, &mut out);
    out
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => collect_text(&e.children, out),
        }
    }
}

/// True when the subtree has non-whitespace text or an image.
pub fn has_content(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| match node {
        Node::Text(t) => !t.trim().is_empty(),
        Node::Element(e) => e.tag == "img" || has_content(&e.children),
    })
}

pub fn count_images(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            Node::Element(e) if e.tag == "img" => 1,
            Node::Element(e) => count_images(&e.children),
            Node::Text(_) => 0,
        })
        .sum()
}

/// Serialize nodes as XHTML-compatible markup: sorted attributes, self-closed void elements,
/// escaped text.
pub fn serialize(nodes: &[Node]) -> String {
    let mut out = String::new();
    write_nodes(nodes, &mut out);
    out
}

fn write_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(&escape_text(t)),
            Node::Element(e) => write_element(e, out),
        }
    }
}

fn write_element(e: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&e.tag);
    for (k, v) in &e.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape_attr(v));
        out.push('"');
    }
    if e.is_void() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    write_nodes(&e.children, out);
    out.push_str("</");
    out.push_str(&e.tag);
    out.push('>');
}

pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}
