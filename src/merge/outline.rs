//! Outline (table of contents) for merged deliverables.

use crate::model::OutlineEntry;
use crate::render::html_escape;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutlineError {
    #[error("Outline entry {index} has a blank title")]
    BlankTitle { index: usize },

    #[error("Outline entry {index} starts at {position}, not after {previous}")]
    NonIncreasing {
        index: usize,
        position: usize,
        previous: usize,
    },
}

/// Check that every entry has a title and that positions strictly increase.
pub fn validate(entries: &[OutlineEntry]) -> Result<(), OutlineError> {
    let mut previous: Option<usize> = None;
    for (index, entry) in entries.iter().enumerate() {
        if entry.title.trim().is_empty() {
            return Err(OutlineError::BlankTitle { index });
        }
        if let Some(prev) = previous {
            if entry.position <= prev {
                return Err(OutlineError::NonIncreasing {
                    index,
                    position: entry.position,
                    previous: prev,
                });
            }
        }
        previous = Some(entry.position);
    }
    Ok(())
}

/// Consecutive entries sharing a section label, in order. Unlabelled runs get `None`.
pub fn group_by_section(entries: &[OutlineEntry]) -> Vec<(Option<&str>, &[OutlineEntry])> {
    let mut groups: Vec<(Option<&str>, &[OutlineEntry])> = Vec::new();
    let mut start = 0;
    for i in 1..=entries.len() {
        let boundary = i == entries.len()
            || entries[i].section_label != entries[start].section_label;
        if boundary {
            groups.push((entries[start].section_label.as_deref(), &entries[start..i]));
            start = i;
        }
    }
    groups
}

/// `<nav class="outline">` block linking every entry's anchor.
pub fn render_nav(entries: &[OutlineEntry]) -> String {
    let mut out = String::from("<nav class=\"outline\">\n<h2>Contents</h2>\n");
    for (label, group) in group_by_section(entries) {
        if let Some(label) = label {
            out.push_str(&format!("<h3>{}</h3>\n", html_escape(label)));
        }
        out.push_str("<ol>\n");
        for entry in group {
            out.push_str(&format!(
                "<li><a href=\"#{}\">{}</a></li>\n",
                entry.anchor,
                html_escape(&entry.title)
            ));
        }
        out.push_str("</ol>\n");
    }
    out.push_str("</nav>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, position: usize, section: Option<&str>) -> OutlineEntry {
        OutlineEntry {
            title: title.to_string(),
            position,
            anchor: format!("item-{:03}", position),
            section_label: section.map(str::to_string),
        }
    }

    #[test]
    fn accepts_strictly_increasing_positions() {
        let entries = vec![entry("a", 0, None), entry("b", 10, None), entry("c", 11, None)];
        assert_eq!(validate(&entries), Ok(()));
        assert_eq!(validate(&[]), Ok(()));
    }

    #[test]
    fn rejects_blank_titles_and_repeated_positions() {
        assert_eq!(
            validate(&[entry("a", 0, None), entry("  ", 5, None)]),
            Err(OutlineError::BlankTitle { index: 1 })
        );
        assert_eq!(
            validate(&[entry("a", 5, None), entry("b", 5, None)]),
            Err(OutlineError::NonIncreasing {
                index: 1,
                position: 5,
                previous: 5
            })
        );
    }

    #[test]
    fn groups_consecutive_sections() {
        let entries = vec![
            entry("a", 0, Some("Intro")),
            entry("b", 1, Some("Intro")),
            entry("c", 2, None),
            entry("d", 3, Some("Intro")),
        ];
        let groups = group_by_section(&entries);
        let shape: Vec<(Option<&str>, usize)> = groups.iter().map(|(l, g)| (*l, g.len())).collect();
        assert_eq!(shape, vec![(Some("Intro"), 2), (None, 1), (Some("Intro"), 1)]);
    }

    #[test]
    fn nav_links_anchors_and_escapes() {
        let nav = render_nav(&[entry("A & B", 0, Some("Part <1>"))]);
        assert!(nav.starts_with("<nav class=\"outline\">"));
        assert!(nav.contains("<h3>Part &lt;1&gt;</h3>"));
        assert!(nav.contains("<a href=\"#item-000\">A &amp; B</a>"));
    }
}
