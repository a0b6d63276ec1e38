//! Merge stage: successful artifacts, in collection order, bound into one or more deliverables.

mod epub;
mod markdown;
mod outline;

pub use epub::{write_epub, EpubError};
pub use markdown::render_markdown;
pub use outline::{render_nav, validate as validate_outline, OutlineError};

use crate::model::{ItemResult, MergedDeliverable, OutlineEntry};
use crate::render::{file_stem, html_escape, ordinal_width, ITEM_CLASS, PRINT_CSS};
use crate::sanitize::tree::{self, Element, Node};
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

const GENERATOR: &str = concat!("collate ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Html,
    Epub,
    #[serde(alias = "md")]
    Markdown,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Html => "html",
            OutputFormat::Epub => "epub",
            OutputFormat::Markdown => "md",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputFormat::Html => "html",
            OutputFormat::Epub => "epub",
            OutputFormat::Markdown => "markdown",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "html" => Ok(OutputFormat::Html),
            "epub" => Ok(OutputFormat::Epub),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!(
                "Unknown format '{}'. Expected one of: html, epub, markdown",
                other
            )),
        }
    }
}

/// One successful item as it enters a deliverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedItem {
    pub original_index: usize,
    pub title: String,
    pub section_label: Option<String>,
    /// Sanitized body markup extracted from the item's artifact.
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Nothing to merge: no item was retrieved successfully")]
    NothingToMerge,

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to package {path}: {source}")]
    Epub {
        path: PathBuf,
        #[source]
        source: EpubError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub deliverables: Vec<MergedDeliverable>,
    /// Per-item artifacts deleted after the deliverables were written.
    pub removed_artifacts: usize,
    /// Soft failures: unreadable artifacts and cleanup problems.
    pub warnings: Vec<String>,
}

pub struct ArtifactMerger {
    title: String,
    formats: Vec<OutputFormat>,
    delete_after_merge: bool,
}

impl ArtifactMerger {
    /// Duplicate formats are ignored; an empty list means HTML only.
    pub fn new(title: impl Into<String>, formats: &[OutputFormat]) -> Self {
        let mut formats = formats.to_vec();
        formats.sort();
        formats.dedup();
        if formats.is_empty() {
            formats.push(OutputFormat::Html);
        }
        Self {
            title: title.into(),
            formats,
            delete_after_merge: false,
        }
    }

    pub fn delete_after_merge(mut self, enabled: bool) -> Self {
        self.delete_after_merge = enabled;
        self
    }

    pub fn formats(&self) -> &[OutputFormat] {
        &self.formats
    }

    /// Where the deliverable of `format` lands inside `output_dir`.
    pub fn destination(&self, output_dir: &Path, format: OutputFormat) -> PathBuf {
        output_dir.join(format!("{}.{}", file_stem(&self.title), format.extension()))
    }

    /// Merge the successful results in ascending `original_index` order, whatever order
    /// `results` is in. Per-item artifacts are removed only after every deliverable has
    /// been written, and only if requested.
    pub fn merge(
        &self,
        results: &[ItemResult],
        output_dir: &Path,
    ) -> Result<MergeOutcome, MergeError> {
        let mut outcome = MergeOutcome::default();

        let mut successes: Vec<&ItemResult> = results.iter().filter(|r| r.is_success()).collect();
        successes.sort_by_key(|r| r.original_index);

        let mut items = Vec::with_capacity(successes.len());
        let mut merged_paths = Vec::with_capacity(successes.len());
        for result in successes {
            let Some(artifact) = result.artifact() else {
                continue;
            };
            match fs::read_to_string(&artifact.path) {
                Ok(page) => {
                    items.push(MergedItem {
                        original_index: result.original_index,
                        title: result.title.clone(),
                        section_label: result.section_label.clone(),
                        body: extract_body(&page),
                    });
                    merged_paths.push(artifact.path.clone());
                }
                Err(e) => {
                    warn!(
                        index = result.original_index,
                        path = %artifact.path.display(),
                        error = %e,
                        "artifact unreadable, skipping"
                    );
                    outcome.warnings.push(format!(
                        "Skipped item {} ({}): cannot read {}: {}",
                        result.original_index + 1,
                        result.title,
                        artifact.path.display(),
                        e
                    ));
                }
            }
        }
        if items.is_empty() {
            return Err(MergeError::NothingToMerge);
        }

        fs::create_dir_all(output_dir).map_err(|e| MergeError::Write {
            path: output_dir.to_path_buf(),
            source: e,
        })?;

        let width = ordinal_width(results.len());
        for &format in &self.formats {
            let path = self.destination(output_dir, format);
            let deliverable = match format {
                OutputFormat::Html => self.write_html(&path, &items, width)?,
                OutputFormat::Epub => self.write_epub(&path, &items)?,
                OutputFormat::Markdown => self.write_markdown(&path, &items)?,
            };
            info!(
                path = %deliverable.path.display(),
                items = deliverable.item_count,
                format = %format,
                "deliverable written"
            );
            outcome.deliverables.push(deliverable);
        }

        if self.delete_after_merge {
            for path in merged_paths {
                if outcome.deliverables.iter().any(|d| d.path == path) {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => outcome.removed_artifacts += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to remove artifact");
                        outcome
                            .warnings
                            .push(format!("Could not remove {}: {}", path.display(), e));
                    }
                }
            }
        }

        Ok(outcome)
    }

    fn write_html(
        &self,
        path: &Path,
        items: &[MergedItem],
        width: usize,
    ) -> Result<MergedDeliverable, MergeError> {
        let (html, outline, warnings) = merged_html(&self.title, items, width);
        write_durably(path, |file| {
            file.write_all(html.as_bytes()).map_err(|e| MergeError::Write {
                path: path.to_path_buf(),
                source: e,
            })
        })?;
        Ok(MergedDeliverable {
            path: path.to_path_buf(),
            item_count: items.len(),
            outline,
            warnings,
        })
    }

    fn write_epub(
        &self,
        path: &Path,
        items: &[MergedItem],
    ) -> Result<MergedDeliverable, MergeError> {
        let identifier = format!("urn:collate:{}", file_stem(&self.title));
        write_durably(path, |file| {
            write_epub(&self.title, &identifier, items, file)
                .map(|_| ())
                .map_err(|e| MergeError::Epub {
                    path: path.to_path_buf(),
                    source: e,
                })
        })?;
        // Chapters are numbered from 1; the visible contents page is chapter 0.
        let entries: Vec<OutlineEntry> = items
            .iter()
            .enumerate()
            .map(|(i, item)| OutlineEntry {
                title: item.title.clone(),
                position: i + 1,
                anchor: format!("chapter-{}.xhtml", i + 1),
                section_label: item.section_label.clone(),
            })
            .collect();
        let (outline, warnings) = checked_outline(entries);
        Ok(MergedDeliverable {
            path: path.to_path_buf(),
            item_count: items.len(),
            outline,
            warnings,
        })
    }

    fn write_markdown(
        &self,
        path: &Path,
        items: &[MergedItem],
    ) -> Result<MergedDeliverable, MergeError> {
        let (text, headings) = render_markdown(&self.title, items);
        write_durably(path, |file| {
            file.write_all(text.as_bytes()).map_err(|e| MergeError::Write {
                path: path.to_path_buf(),
                source: e,
            })
        })?;
        let entries: Vec<OutlineEntry> = items
            .iter()
            .zip(headings)
            .map(|(item, position)| OutlineEntry {
                title: item.title.clone(),
                position,
                anchor: markdown_anchor(&item.title),
                section_label: item.section_label.clone(),
            })
            .collect();
        let (outline, warnings) = checked_outline(entries);
        Ok(MergedDeliverable {
            path: path.to_path_buf(),
            item_count: items.len(),
            outline,
            warnings,
        })
    }
}

/// Body markup of an artifact page: the children of the item article, or of `<body>` for
/// pages that lack one.
pub fn extract_body(page: &str) -> String {
    let doc = Html::parse_document(page);
    let root = doc.root_element();
    let article = root
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "article" && el.value().classes().any(|c| c == ITEM_CLASS));
    let container = article.or_else(|| {
        root.descendants()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "body")
    });
    match container {
        Some(el) => tree::serialize(&Element::from_element_ref(el).children),
        None => tree::serialize(&[Node::Text(tree::text_of(&[Node::Element(
            Element::from_element_ref(root),
        )]))]),
    }
}

/// Merged HTML page plus the outline of its content stream.
///
/// Positions are byte offsets into the stream of item sections, so they do not depend on
/// whether the navigation block made it into the page.
fn merged_html(
    title: &str,
    items: &[MergedItem],
    width: usize,
) -> (String, Vec<OutlineEntry>, Vec<String>) {
    let mut stream = String::new();
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let anchor = format!("item-{:0width$}", item.original_index + 1, width = width);
        entries.push(OutlineEntry {
            title: item.title.clone(),
            position: stream.len(),
            anchor: anchor.clone(),
            section_label: item.section_label.clone(),
        });
        stream.push_str(&format!(
            "<section class=\"item\" id=\"{}\">\n<h2>{}</h2>\n{}\n</section>\n",
            anchor,
            html_escape(&item.title),
            item.body
        ));
    }

    let (outline, warnings) = checked_outline(entries);
    let nav = if outline.is_empty() {
        String::new()
    } else {
        render_nav(&outline)
    };

    let title = html_escape(title);
    let page = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\"/>\n\
         <meta name=\"generator\" content=\"{GENERATOR}\"/>\n\
         <meta name=\"item-count\" content=\"{count}\"/>\n<title>{title}</title>\n\
         <style>{PRINT_CSS}</style>\n</head>\n<body>\n<h1>{title}</h1>\n{nav}{stream}</body>\n</html>\n",
        count = items.len(),
    );
    (page, outline, warnings)
}

/// Validated outline, or no outline and a warning.
fn checked_outline(entries: Vec<OutlineEntry>) -> (Vec<OutlineEntry>, Vec<String>) {
    match validate_outline(&entries) {
        Ok(()) => (entries, Vec::new()),
        Err(e) => {
            warn!(error = %e, "outline construction failed, writing deliverable without it");
            (Vec::new(), vec![format!("Outline omitted: {}", e)])
        }
    }
}

fn markdown_anchor(title: &str) -> String {
    let slug: String = title
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            c if c.is_alphanumeric() || c == '-' || c == '_' => Some(c),
            c if c.is_whitespace() => Some('-'),
            _ => None,
        })
        .collect();
    format!("#{}", slug)
}

/// Write through a temporary sibling, flush it to disk and rename it into place.
fn write_durably<F>(path: &Path, fill: F) -> Result<(), MergeError>
where
    F: FnOnce(&mut File) -> Result<(), MergeError>,
{
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.partial", file_name));
    let io_err = |e: std::io::Error| MergeError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    let result = (|| {
        let mut file = File::create(&tmp).map_err(io_err)?;
        fill(&mut file)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, path).map_err(io_err)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArtifactHandle, ErrorKind, ItemDescriptor};
    use crate::render::artifact_page;

    fn descriptor(index: usize, title: &str, section: Option<&str>) -> ItemDescriptor {
        ItemDescriptor {
            id: index.to_string(),
            title: title.to_string(),
            address: format!("https://example.com/{}", index),
            section_label: section.map(str::to_string),
            original_index: index,
        }
    }

    /// Writes an artifact page for every entry and returns the result slots.
    fn rendered(dir: &Path, specs: &[(&str, Option<&str>, bool)]) -> Vec<ItemResult> {
        specs
            .iter()
            .enumerate()
            .map(|(i, (title, section, ok))| {
                let item = descriptor(i, title, *section);
                if !ok {
                    return ItemResult::failed(&item, 1, ErrorKind::AuthOrPermission, "login wall");
                }
                let path = dir.join(crate::render::artifact_file_name(i, specs.len(), title));
                let page = artifact_page(title, &format!("<p>Body of {}</p>", i));
                fs::write(&path, &page).unwrap();
                ItemResult::rendered(
                    &item,
                    1,
                    ArtifactHandle {
                        path,
                        bytes: page.len() as u64,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn extracts_item_body_from_artifact() {
        let page = artifact_page("T", "<p>one</p><pre><code>a\n  b</code></pre>");
        assert_eq!(extract_body(&page), "<p>one</p><pre><code>a\n  b</code></pre>");
        assert_eq!(extract_body("<html><body><p>x</p></body></html>"), "<p>x</p>");
    }

    #[test]
    fn merges_successes_in_index_order_with_outline() {
        let dir = tempfile::tempdir().unwrap();
        let results = rendered(
            dir.path(),
            &[
                ("One", Some("Part A"), true),
                ("Two", Some("Part A"), false),
                ("Three", Some("Part B"), true),
            ],
        );
        let outcome = ArtifactMerger::new("My Course", &[OutputFormat::Html])
            .merge(&results, dir.path())
            .unwrap();
        let deliverable = &outcome.deliverables[0];
        assert_eq!(deliverable.path, dir.path().join("My_Course.html"));
        assert_eq!(deliverable.item_count, 2);
        assert!(deliverable.warnings.is_empty());

        let titles: Vec<&str> = deliverable.outline.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["One", "Three"]);
        assert_eq!(deliverable.outline[0].anchor, "item-001");
        assert_eq!(deliverable.outline[1].anchor, "item-003");
        assert!(deliverable.outline[0].position < deliverable.outline[1].position);

        let html = fs::read_to_string(&deliverable.path).unwrap();
        assert!(html.contains("<meta name=\"item-count\" content=\"2\"/>"));
        assert!(html.contains("<nav class=\"outline\">"));
        assert!(html.contains("<h3>Part A</h3>"));
        assert!(!html.contains("Body of 1"));
        let first = html.find("Body of 0").unwrap();
        let third = html.find("Body of 2").unwrap();
        assert!(first < third);
        assert!(!dir.path().join(".My_Course.html.partial").exists());
    }

    #[test]
    fn output_ignores_slot_order() {
        let dir = tempfile::tempdir().unwrap();
        let results = rendered(
            dir.path(),
            &[("a", None, true), ("b", None, true), ("c", None, true), ("d", None, true)],
        );
        let merger = ArtifactMerger::new("Same", &[OutputFormat::Html, OutputFormat::Epub]);

        let out_a = dir.path().join("a");
        let out_b = dir.path().join("b");
        merger.merge(&results, &out_a).unwrap();
        let mut shuffled = results.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);
        merger.merge(&shuffled, &out_b).unwrap();

        for name in ["Same.html", "Same.epub"] {
            assert_eq!(
                fs::read(out_a.join(name)).unwrap(),
                fs::read(out_b.join(name)).unwrap(),
                "{} differs",
                name
            );
        }
    }

    #[test]
    fn blank_title_drops_outline_but_keeps_deliverable() {
        let dir = tempfile::tempdir().unwrap();
        let results = rendered(dir.path(), &[("Fine", None, true), ("   ", None, true)]);
        let outcome = ArtifactMerger::new("C", &[OutputFormat::Html])
            .merge(&results, dir.path())
            .unwrap();
        let deliverable = &outcome.deliverables[0];
        assert!(deliverable.outline.is_empty());
        assert_eq!(deliverable.warnings.len(), 1);
        assert!(deliverable.warnings[0].contains("blank title"));
        let html = fs::read_to_string(&deliverable.path).unwrap();
        assert!(!html.contains("<nav"));
        assert!(html.contains("Body of 1"));
    }

    #[test]
    fn cleanup_runs_after_every_format_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let results = rendered(dir.path(), &[("x", None, true), ("y", None, true)]);
        let outcome = ArtifactMerger::new("Book", &[OutputFormat::Markdown, OutputFormat::Html])
            .delete_after_merge(true)
            .merge(&results, dir.path())
            .unwrap();
        assert_eq!(outcome.deliverables.len(), 2);
        assert_eq!(outcome.removed_artifacts, 2);
        for r in &results {
            assert!(!r.artifact().unwrap().path.exists());
        }
        assert!(dir.path().join("Book.html").exists());
        let md = fs::read_to_string(dir.path().join("Book.md")).unwrap();
        assert!(md.starts_with("# Book"));
        let md_outline = &outcome
            .deliverables
            .iter()
            .find(|d| d.path.ends_with("Book.md"))
            .unwrap()
            .outline;
        assert!(md[md_outline[1].position..].starts_with("## y"));
    }

    #[test]
    fn failed_write_keeps_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let results = rendered(dir.path(), &[("x", None, true)]);
        // A directory where the deliverable should go makes the rename fail.
        fs::create_dir(dir.path().join("Blocked.html")).unwrap();
        fs::write(dir.path().join("Blocked.html").join("keep"), "x").unwrap();
        let err = ArtifactMerger::new("Blocked", &[OutputFormat::Html])
            .delete_after_merge(true)
            .merge(&results, dir.path())
            .unwrap_err();
        assert!(matches!(err, MergeError::Write { .. }));
        assert!(results[0].artifact().unwrap().path.exists());
        assert!(!dir.path().join(".Blocked.html.partial").exists());
    }

    #[test]
    fn nothing_to_merge_without_successes() {
        let dir = tempfile::tempdir().unwrap();
        let results = rendered(dir.path(), &[("x", None, false)]);
        let err = ArtifactMerger::new("C", &[]).merge(&results, dir.path()).unwrap_err();
        assert!(matches!(err, MergeError::NothingToMerge));
    }

    #[test]
    fn unreadable_artifact_becomes_warning() {
        let dir = tempfile::tempdir().unwrap();
        let results = rendered(dir.path(), &[("x", None, true), ("y", None, true)]);
        fs::remove_file(&results[0].artifact().unwrap().path).unwrap();
        let outcome = ArtifactMerger::new("C", &[OutputFormat::Html])
            .merge(&results, dir.path())
            .unwrap();
        assert_eq!(outcome.deliverables[0].item_count, 1);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("HTML".parse::<OutputFormat>(), Ok(OutputFormat::Html));
        assert_eq!("md".parse::<OutputFormat>(), Ok(OutputFormat::Markdown));
        assert!("pdf".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Markdown.extension(), "md");
    }
}
