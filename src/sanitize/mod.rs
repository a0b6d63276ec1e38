//! Content sanitization: raw page markup in, a small allow-listed document out.
//!
//! The transform is pure. The parsed page is copied into an owned [`tree::Element`], rewritten
//! into a new tree and serialized deterministically, so sanitizing the output again yields
//! the same bytes.

mod code;
pub(crate) mod tree;

pub use code::{CodeDetector, HeuristicCodeDetector};

use crate::model::RawContent;
use reqwest::Url;
use scraper::{Html, Selector};
use thiserror::Error;
use tree::{has_content, Element, Node};

/// Selectors tried in order to find the content root.
pub const DEFAULT_CONTENT_SELECTORS: &[&str] =
    &["[class*=\"articleContent\"]", ".article-content", "article"];

const DENIED_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "nav", "aside", "footer", "form", "button", "audio",
    "video", "svg", "template", "object", "embed", "input", "select", "textarea", "head", "link",
    "meta", "title",
];

const DEFAULT_DENIED_SUBSTRINGS: &[&str] = &[
    "comment",
    "recommend",
    "share",
    "social",
    "advert",
    "banner",
    "sidebar",
    "catalog",
    "directory",
    "toc",
    "outline",
    "subscribe",
    "audio",
    "player",
    "back-to-top",
];

const DEFAULT_DENIED_CLASS_TOKENS: &[&str] = &["ad", "ads"];

/// Blocks whose content is phrasing only.
const TEXT_BLOCKS: &[&str] = &["p", "h1", "h2", "h3", "h4", "h5", "h6", "figcaption"];
const FLOW_BLOCKS: &[&str] = &["blockquote", "figure"];
const INLINE_TAGS: &[&str] = &[
    "a", "img", "br", "em", "strong", "b", "i", "u", "s", "del", "sub", "sup", "code",
];
const BLOCK_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "figcaption", "blockquote", "figure", "ul", "ol",
    "pre", "table", "hr",
];

/// Disallowed elements that separate paragraphs when unwrapped.
const BLOCK_CONTAINERS: &[&str] = &[
    "div", "section", "article", "main", "header", "address", "details", "summary", "dl", "dt",
    "dd", "center", "fieldset", "li", "tr", "td", "th", "thead", "tbody", "tfoot", "body",
    "html",
];

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("No usable content left after cleaning {source_url}")]
    Empty { source_url: String },

    #[error("Invalid content selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

/// Sanitized, allow-listed markup for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedDocument {
    pub html: String,
    /// Characters of visible text.
    pub text_len: usize,
    pub image_count: usize,
}

/// Site-facing knobs of the sanitizer.
#[derive(Debug, Clone)]
pub struct SanitizeRules {
    pub content_selectors: Vec<String>,
    /// Matched against `class` and `id` values.
    pub denied_substrings: Vec<String>,
    /// Matched against individual class tokens.
    pub denied_class_tokens: Vec<String>,
}

impl Default for SanitizeRules {
    fn default() -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            content_selectors: owned(DEFAULT_CONTENT_SELECTORS),
            denied_substrings: owned(DEFAULT_DENIED_SUBSTRINGS),
            denied_class_tokens: owned(DEFAULT_DENIED_CLASS_TOKENS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    /// Block children only; loose phrasing is grouped into paragraphs.
    Block,
    /// Phrasing content only.
    Inline,
    /// Inside `ul`/`ol`.
    List,
    /// Inside `table`.
    Table,
    /// Inside `thead`/`tbody`/`tfoot`.
    Section,
    /// Inside `tr`.
    Row,
}

#[derive(Clone, Copy)]
struct Walk<'a> {
    base: Option<&'a Url>,
    in_link: bool,
}

pub struct ContentSanitizer {
    content_selectors: Vec<Selector>,
    body: Option<Selector>,
    denied_substrings: Vec<String>,
    denied_class_tokens: Vec<String>,
    detector: Box<dyn CodeDetector>,
}

impl ContentSanitizer {
    pub fn new(rules: SanitizeRules) -> Result<Self, SanitizeError> {
        let content_selectors = rules
            .content_selectors
            .iter()
            .map(|s| {
                Selector::parse(s).map_err(|e| SanitizeError::InvalidSelector {
                    selector: s.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            content_selectors,
            body: Selector::parse("body").ok(),
            denied_substrings: rules
                .denied_substrings
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            denied_class_tokens: rules
                .denied_class_tokens
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            detector: Box::new(HeuristicCodeDetector),
        })
    }

    pub fn with_code_detector(mut self, detector: Box<dyn CodeDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Clean `raw` into a [`SanitizedDocument`]; fails when nothing usable remains.
    pub fn sanitize(&self, raw: &RawContent) -> Result<SanitizedDocument, SanitizeError> {
        let root = self.content_root(&raw.html);
        let base = Url::parse(&raw.source_url).ok();
        let walk = Walk {
            base: base.as_ref(),
            in_link: false,
        };
        let cleaned = self.clean_children(&root.children, Context::Block, walk);
        let blocks = group_blocks(cleaned);
        if !has_content(&blocks) {
            return Err(SanitizeError::Empty {
                source_url: raw.source_url.clone(),
            });
        }
        Ok(SanitizedDocument {
            html: tree::serialize(&blocks),
            text_len: tree::text_of(&blocks).trim().chars().count(),
            image_count: tree::count_images(&blocks),
        })
    }

    fn content_root(&self, html: &str) -> Element {
        let doc = Html::parse_document(html);
        let found = self
            .content_selectors
            .iter()
            .find_map(|sel| doc.select(sel).next())
            .or_else(|| self.body.as_ref().and_then(|b| doc.select(b).next()))
            .unwrap_or_else(|| doc.root_element());
        Element::from_element_ref(found)
    }

    fn is_denied(&self, el: &Element) -> bool {
        if DENIED_TAGS.contains(&el.tag.as_str()) {
            return true;
        }
        let class = el.attr("class").unwrap_or("").to_ascii_lowercase();
        if el.tag == "header" && !class.contains("article-header") {
            return true;
        }
        if el
            .classes()
            .any(|c| self.denied_class_tokens.iter().any(|t| c.eq_ignore_ascii_case(t)))
        {
            return true;
        }
        let id = el.attr("id").unwrap_or("").to_ascii_lowercase();
        self.denied_substrings
            .iter()
            .any(|s| class.contains(s.as_str()) || id.contains(s.as_str()))
    }

    fn clean_children(&self, nodes: &[Node], ctx: Context, walk: Walk<'_>) -> Vec<Node> {
        nodes
            .iter()
            .flat_map(|n| self.clean_node(n, ctx, walk))
            .collect()
    }

    fn clean_node(&self, node: &Node, ctx: Context, walk: Walk<'_>) -> Vec<Node> {
        match node {
            Node::Text(t) => match ctx {
                Context::Table | Context::Section | Context::Row => Vec::new(),
                _ => vec![Node::Text(t.clone())],
            },
            Node::Element(el) => {
                if self.is_denied(el) {
                    return Vec::new();
                }
                match ctx {
                    Context::Table => self.clean_in_table(el, walk),
                    Context::Section => self.clean_in_section(el, walk),
                    Context::Row => self.clean_in_row(el, walk),
                    Context::Inline => self.clean_inline(el, walk),
                    Context::Block | Context::List => self.clean_flow(el, ctx, walk),
                }
            }
        }
    }

    fn clean_flow(&self, el: &Element, ctx: Context, walk: Walk<'_>) -> Vec<Node> {
        if self.detector.is_code_block(el) {
            return code::canonical_block(el).into_iter().collect();
        }
        let tag = el.tag.as_str();
        if ctx == Context::List {
            if tag == "li" {
                return self.flow_element("li", &el.children, walk);
            }
            if !is_allowed(tag) {
                return self.clean_children(&el.children, Context::List, walk);
            }
        }
        match tag {
            t if TEXT_BLOCKS.contains(&t) => {
                let children = normalize_inline(
                    self.clean_children(&el.children, Context::Inline, walk),
                    true,
                );
                keep_if_content(t, vec![], children)
            }
            t if FLOW_BLOCKS.contains(&t) => self.flow_element(t, &el.children, walk),
            "ul" | "ol" => {
                let items = wrap_list_items(self.clean_children(&el.children, Context::List, walk));
                if items.is_empty() {
                    Vec::new()
                } else {
                    vec![Node::Element(Element::new(tag, vec![], items))]
                }
            }
            "table" => {
                // Captions come back as paragraphs and are moved ahead of the table.
                let (mut out, rest): (Vec<Node>, Vec<Node>) = self
                    .clean_children(&el.children, Context::Table, walk)
                    .into_iter()
                    .partition(|n| n.is_tag("p"));
                let sections = wrap_loose_rows(rest);
                if !sections.is_empty() {
                    out.push(Node::Element(Element::new("table", vec![], sections)));
                }
                out
            }
            "hr" => vec![Node::Element(Element::new("hr", vec![], vec![]))],
            t if INLINE_TAGS.contains(&t) => self.clean_inline(el, walk),
            t if BLOCK_CONTAINERS.contains(&t) => {
                group_blocks(self.clean_children(&el.children, Context::Block, walk))
            }
            _ => self.clean_children(&el.children, ctx, walk),
        }
    }

    /// A flow container (`li`, `blockquote`, `figure`, table cells): paragraphs when it holds
    /// blocks, plain phrasing otherwise.
    fn flow_element(&self, tag: &str, children: &[Node], walk: Walk<'_>) -> Vec<Node> {
        let cleaned = self.clean_children(children, Context::Block, walk);
        let content = if cleaned.iter().any(is_block) {
            group_blocks(cleaned)
        } else {
            normalize_inline(cleaned, true)
        };
        keep_if_content(tag, vec![], content)
    }

    fn clean_inline(&self, el: &Element, walk: Walk<'_>) -> Vec<Node> {
        match el.tag.as_str() {
            "br" => vec![Node::Element(Element::new("br", vec![], vec![]))],
            "img" => resolve_image(el, walk.base)
                .map(|attrs| Node::Element(Element::new("img", attrs, vec![])))
                .into_iter()
                .collect(),
            "a" => {
                let inner = Walk {
                    in_link: true,
                    ..walk
                };
                let children = normalize_inline(
                    self.clean_children(&el.children, Context::Inline, inner),
                    false,
                );
                match resolve_link(el, walk.base).filter(|_| !walk.in_link) {
                    Some(href) => keep_if_content("a", vec![("href".to_string(), href)], children),
                    None => children,
                }
            }
            t if INLINE_TAGS.contains(&t) => {
                let children = normalize_inline(
                    self.clean_children(&el.children, Context::Inline, walk),
                    false,
                );
                keep_if_content(t, vec![], children)
            }
            t if BLOCK_CONTAINERS.contains(&t) || BLOCK_TAGS.contains(&t) => {
                let mut out = vec![Node::Text(" ".to_string())];
                out.extend(self.clean_children(&el.children, Context::Inline, walk));
                out.push(Node::Text(" ".to_string()));
                out
            }
            _ => self.clean_children(&el.children, Context::Inline, walk),
        }
    }

    fn clean_in_table(&self, el: &Element, walk: Walk<'_>) -> Vec<Node> {
        match el.tag.as_str() {
            "thead" | "tbody" | "tfoot" => {
                let rows = self.clean_children(&el.children, Context::Section, walk);
                if rows.is_empty() {
                    Vec::new()
                } else {
                    vec![Node::Element(Element::new(&el.tag, vec![], rows))]
                }
            }
            "tr" => self.clean_row(el, walk),
            "caption" => {
                let children = normalize_inline(
                    self.clean_children(&el.children, Context::Inline, walk),
                    true,
                );
                keep_if_content("p", vec![], children)
            }
            "table" => Vec::new(),
            _ => self.clean_children(&el.children, Context::Table, walk),
        }
    }

    fn clean_in_section(&self, el: &Element, walk: Walk<'_>) -> Vec<Node> {
        match el.tag.as_str() {
            "tr" => self.clean_row(el, walk),
            "table" => Vec::new(),
            _ => self.clean_children(&el.children, Context::Section, walk),
        }
    }

    fn clean_row(&self, el: &Element, walk: Walk<'_>) -> Vec<Node> {
        let cells = self.clean_children(&el.children, Context::Row, walk);
        if cells.is_empty() {
            Vec::new()
        } else {
            vec![Node::Element(Element::new("tr", vec![], cells))]
        }
    }

    fn clean_in_row(&self, el: &Element, walk: Walk<'_>) -> Vec<Node> {
        match el.tag.as_str() {
            "th" | "td" => {
                let attrs = el
                    .attrs
                    .iter()
                    .filter(|(k, v)| {
                        (k == "colspan" || k == "rowspan")
                            && !v.is_empty()
                            && v.chars().all(|c| c.is_ascii_digit())
                    })
                    .cloned()
                    .collect();
                let cleaned = self.clean_children(&el.children, Context::Block, walk);
                let content = if cleaned.iter().any(is_block) {
                    group_blocks(cleaned)
                } else {
                    normalize_inline(cleaned, true)
                };
                vec![Node::Element(Element::new(&el.tag, attrs, content))]
            }
            "table" | "tr" => Vec::new(),
            _ => self.clean_children(&el.children, Context::Row, walk),
        }
    }
}

fn is_allowed(tag: &str) -> bool {
    BLOCK_TAGS.contains(&tag)
        || INLINE_TAGS.contains(&tag)
        || matches!(tag, "li" | "thead" | "tbody" | "tfoot" | "tr" | "th" | "td")
}

fn is_block(node: &Node) -> bool {
    node.element()
        .is_some_and(|e| BLOCK_TAGS.contains(&e.tag.as_str()))
}

fn keep_if_content(tag: &str, attrs: Vec<(String, String)>, children: Vec<Node>) -> Vec<Node> {
    if has_content(&children) {
        vec![Node::Element(Element::new(tag, attrs, children))]
    } else {
        Vec::new()
    }
}

/// Merge adjacent text, collapse whitespace runs and drop empty text. With `trim`, leading
/// and trailing whitespace of the run is removed too.
fn normalize_inline(nodes: Vec<Node>, trim: bool) -> Vec<Node> {
    let mut merged: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let Node::Text(t) = &node {
            if let Some(Node::Text(prev)) = merged.last_mut() {
                prev.push_str(t);
                continue;
            }
        }
        merged.push(node);
    }
    let last = merged.len().saturating_sub(1);
    merged
        .into_iter()
        .enumerate()
        .filter_map(|(i, node)| match node {
            Node::Text(t) => {
                let mut s = collapse_whitespace(&t);
                if trim && i == 0 {
                    s = s.trim_start().to_string();
                }
                if trim && i == last {
                    s = s.trim_end().to_string();
                }
                (!s.is_empty()).then_some(Node::Text(s))
            }
            other => Some(other),
        })
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Block context: keep blocks, wrap each run of loose phrasing in a `<p>`.
fn group_blocks(nodes: Vec<Node>) -> Vec<Node> {
    let mut out = Vec::new();
    let mut run = Vec::new();
    for node in nodes {
        if is_block(&node) {
            flush_paragraph(&mut run, &mut out);
            out.push(node);
        } else {
            run.push(node);
        }
    }
    flush_paragraph(&mut run, &mut out);
    out
}

fn flush_paragraph(run: &mut Vec<Node>, out: &mut Vec<Node>) {
    if run.is_empty() {
        return;
    }
    let children = normalize_inline(std::mem::take(run), true);
    out.extend(keep_if_content("p", vec![], children));
}

/// List context: keep `li`, wrap everything else into items.
fn wrap_list_items(nodes: Vec<Node>) -> Vec<Node> {
    let mut out = Vec::new();
    let mut run = Vec::new();
    let flush = |run: &mut Vec<Node>, out: &mut Vec<Node>| {
        if run.is_empty() {
            return;
        }
        let loose = std::mem::take(run);
        let content = if loose.iter().any(is_block) {
            group_blocks(loose)
        } else {
            normalize_inline(loose, true)
        };
        out.extend(keep_if_content("li", vec![], content));
    };
    for node in nodes {
        if node.is_tag("li") {
            flush(&mut run, &mut out);
            out.push(node);
        } else {
            run.push(node);
        }
    }
    flush(&mut run, &mut out);
    out
}

/// Table context: rows directly under the table go into a `tbody`, as a parser would put them.
fn wrap_loose_rows(nodes: Vec<Node>) -> Vec<Node> {
    let mut out = Vec::new();
    let mut rows = Vec::new();
    for node in nodes {
        if node.is_tag("tr") {
            rows.push(node);
        } else {
            if !rows.is_empty() {
                out.push(Node::Element(Element::new("tbody", vec![], std::mem::take(&mut rows))));
            }
            out.push(node);
        }
    }
    if !rows.is_empty() {
        out.push(Node::Element(Element::new("tbody", vec![], rows)));
    }
    out
}

fn resolve_url(raw: &str, base: Option<&Url>) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match base {
        Some(b) => b.join(raw).ok(),
        None => Url::parse(raw).ok(),
    }
}

/// Absolute `href` for a link, or `None` when the link should be unwrapped.
fn resolve_link(el: &Element, base: Option<&Url>) -> Option<String> {
    let href = el.attr("href")?.trim();
    if href.starts_with('#') || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    let url = resolve_url(href, base)?;
    matches!(url.scheme(), "http" | "https" | "mailto").then(|| url.to_string())
}

/// Attributes of a kept image, or `None` when its source cannot be fetched.
fn resolve_image(el: &Element, base: Option<&Url>) -> Option<Vec<(String, String)>> {
    let src = ["src", "data-src", "data-original"]
        .iter()
        .filter_map(|k| el.attr(k))
        .map(str::trim)
        .find(|v| !v.is_empty())?;
    let resolved = if src.to_ascii_lowercase().starts_with("data:image/") {
        src.to_string()
    } else {
        let url = resolve_url(src, base)?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.to_string()
    };
    let mut attrs = vec![("src".to_string(), resolved)];
    if let Some(alt) = el.attr("alt") {
        let alt = collapse_whitespace(alt).trim().to_string();
        if !alt.is_empty() {
            attrs.push(("alt".to_string(), alt));
        }
    }
    Some(attrs)
}
