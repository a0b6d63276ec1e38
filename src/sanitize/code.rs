//! Code block detection and the canonical `<pre><code>` form.

use super::tree::{Element, Node};

const CODE_CLASS_HINTS: &[&str] = &["code", "highlight", "hljs", "syntax"];
const LINE_BREAKING_TAGS: &[&str] = &["div", "p", "li", "tr"];

/// Decides whether an element holds a code block. The heuristic is approximate and
/// source dependent, so it can be swapped.
pub trait CodeDetector: Send + Sync {
    fn is_code_block(&self, el: &Element) -> bool;
}

/// `pre` elements, plus monospace-styled or code-classed elements whose text spans
/// several lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCodeDetector;

impl CodeDetector for HeuristicCodeDetector {
    fn is_code_block(&self, el: &Element) -> bool {
        if el.tag == "pre" {
            return true;
        }
        let styled = el.attr("style").is_some_and(|s| {
            let s = s.to_ascii_lowercase();
            s.contains("monospace")
                || s.contains("white-space: pre")
                || s.contains("white-space:pre")
        });
        let classed = el.classes().any(|c| {
            let c = c.to_ascii_lowercase();
            c.starts_with("language-")
                || c.starts_with("lang-")
                || CODE_CLASS_HINTS.iter().any(|h| {
                    c == *h || c.starts_with(&format!("{}-", h)) || c.ends_with(&format!("-{}", h))
                })
        });
        (styled || classed) && code_text(el).trim().contains('\n')
    }
}

/// Raw text of a code element: `br` and line-level children become newlines.
pub fn code_text(el: &Element) -> String {
    let mut out = String::new();
    push_code_text(&el.children, &mut out);
    out
}

fn push_code_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) if e.tag == "br" => out.push('\n'),
            Node::Element(e) => {
                push_code_text(&e.children, out);
                if LINE_BREAKING_TAGS.contains(&e.tag.as_str()) && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }
}

/// Canonical code text: trailing whitespace trimmed per line, blank-line runs collapsed to
/// one, leading and trailing blank lines removed.
pub fn normalize_code(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// `<pre><code>text</code></pre>`, or `None` when the code is blank.
pub fn canonical_block(el: &Element) -> Option<Node> {
    let text = normalize_code(&code_text(el));
    if text.is_empty() {
        return None;
    }
    let code = Element::new("code", vec![], vec![Node::Text(text)]);
    Some(Node::Element(Element::new(
        "pre",
        vec![],
        vec![Node::Element(code)],
    )))
}
