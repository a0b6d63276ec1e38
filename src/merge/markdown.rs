use super::MergedItem;

/// Markdown rendition of the merged items: `# title`, then `## item` sections in order.
///
/// Also returns the byte offset of every item heading.
pub fn render_markdown(title: &str, items: &[MergedItem]) -> (String, Vec<usize>) {
    let mut out = format!("# {}\n\n", title.trim());
    let mut headings = Vec::with_capacity(items.len());
    let mut current_section: Option<&str> = None;
    for item in items {
        let section = item.section_label.as_deref();
        if section.is_some() && section != current_section {
            out.push_str(&format!("*{}*\n\n", section.unwrap_or_default()));
        }
        current_section = section;
        headings.push(out.len());
        out.push_str(&format!("## {}\n\n", item.title.trim()));
        let md = html2md::parse_html(&item.body);
        out.push_str(md.trim());
        out.push_str("\n\n");
    }
    (out, headings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_and_no_raw_paragraph_tags() {
        let items = vec![
            MergedItem {
                original_index: 0,
                title: "First".to_string(),
                section_label: Some("Part 1".to_string()),
                body: "<p>First paragraph.</p><p>Second <strong>bold</strong>.</p>".to_string(),
            },
            MergedItem {
                original_index: 1,
                title: "Second".to_string(),
                section_label: Some("Part 1".to_string()),
                body: "<ul><li>x</li></ul>".to_string(),
            },
        ];
        let (md, headings) = render_markdown("Course", &items);
        assert_eq!(headings.len(), 2);
        assert!(md[headings[0]..].starts_with("## First"));
        assert!(md[headings[1]..].starts_with("## Second"));
        assert!(md.starts_with("# Course\n\n*Part 1*\n\n## First"));
        assert_eq!(md.matches("*Part 1*").count(), 1);
        assert!(md.contains("## Second"));
        assert!(md.contains("First paragraph."));
        assert!(md.contains("**bold**"));
        assert!(!md.contains("<p>"));
    }
}
