//! Per-item artifacts: one standalone HTML page per item, named so that lexical order is
//! collection order.

use crate::model::{ArtifactHandle, ItemDescriptor};
use crate::sanitize::SanitizedDocument;
use crate::session::{Session, SessionError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1500);

const MAX_STEM_CHARS: usize = 100;
const MIN_ORDINAL_WIDTH: usize = 3;

/// Marks the item body inside an artifact page.
pub const ITEM_CLASS: &str = "collate-item";

/// Print-oriented stylesheet shared by artifacts and merged deliverables.
pub const PRINT_CSS: &str = r#"
body { font-family: -apple-system, "Segoe UI", "PingFang SC", "Microsoft YaHei", sans-serif;
       line-height: 1.7; color: #222; max-width: 46em; margin: 0 auto; padding: 1.5em; }
img, table { max-width: 100%; }
img { height: auto; }
table { border-collapse: collapse; }
th, td { border: 1px solid #ccc; padding: 0.3em 0.6em; }
pre, code { font-family: "SF Mono", Menlo, Consolas, monospace; font-size: 0.9em; }
pre { background: #f6f8fa; padding: 0.8em; white-space: pre-wrap; word-wrap: break-word; }
blockquote { border-left: 3px solid #ddd; margin-left: 0; padding-left: 1em; color: #555; }
@media print {
  body { max-width: none; padding: 0; }
  nav.outline { page-break-after: always; }
  section.item { page-break-before: always; }
  pre, code { white-space: pre-wrap !important; overflow: visible !important; }
  img, table, pre { page-break-inside: avoid; }
}
"#;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Loading item into session failed: {0}")]
    Load(#[source] SessionError),

    #[error("Printing {path} failed: {source}")]
    Print {
        path: PathBuf,
        #[source]
        source: SessionError,
    },

    #[error("Printed artifact {path} is empty")]
    EmptyOutput { path: PathBuf },
}

pub struct ArtifactRenderer {
    output_dir: PathBuf,
    total: usize,
    settle: Duration,
}

impl ArtifactRenderer {
    /// `total` is the collection size; it fixes the width of the ordinal prefix.
    pub fn new(output_dir: impl Into<PathBuf>, total: usize, settle: Duration) -> Self {
        Self {
            output_dir: output_dir.into(),
            total,
            settle,
        }
    }

    pub fn destination(&self, item: &ItemDescriptor) -> PathBuf {
        self.output_dir.join(artifact_file_name(
            item.original_index,
            self.total,
            &item.title,
        ))
    }

    /// Load the document into `session`, give it a moment to settle and print it.
    pub async fn render(
        &self,
        session: &mut dyn Session,
        item: &ItemDescriptor,
        doc: &SanitizedDocument,
    ) -> Result<ArtifactHandle, RenderError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| RenderError::CreateDir {
                path: self.output_dir.clone(),
                source: e,
            })?;

        let page = artifact_page(&item.title, &doc.html);
        session.load_html(&page).await.map_err(RenderError::Load)?;

        match session.settle(self.settle).await {
            Ok(report) => debug!(
                index = item.original_index,
                probed = report.probed,
                resolved = report.resolved,
                timed_out = report.timed_out,
                "settled"
            ),
            Err(e) => {
                warn!(index = item.original_index, error = %e, "settle failed, printing anyway")
            }
        }

        let path = self.destination(item);
        let bytes = session
            .print(&path)
            .await
            .map_err(|e| RenderError::Print {
                path: path.clone(),
                source: e,
            })?;
        if bytes == 0 {
            return Err(RenderError::EmptyOutput { path });
        }
        Ok(ArtifactHandle { path, bytes })
    }
}

/// Standalone page for one item.
pub fn artifact_page(title: &str, body: &str) -> String {
    let title = html_escape(title);
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\"/>\n<title>{title}</title>\n\
         <style>{PRINT_CSS}</style>\n</head>\n<body>\n<h1>{title}</h1>\n\
         <article class=\"{ITEM_CLASS}\">{body}</article>\n</body>\n</html>\n"
    )
}

/// `{ordinal}_{stem}.html`, ordinal 1-based and zero padded to at least three digits.
pub fn artifact_file_name(original_index: usize, total: usize, title: &str) -> String {
    format!(
        "{:0width$}_{}.html",
        original_index + 1,
        file_stem(title),
        width = ordinal_width(total)
    )
}

/// Digits used for zero-padded ordinals in a collection of `total` items.
pub fn ordinal_width(total: usize) -> usize {
    total.max(1).to_string().len().max(MIN_ORDINAL_WIDTH)
}

/// Filesystem-safe stem for a title.
pub fn file_stem(title: &str) -> String {
    let mut stem = String::with_capacity(title.len());
    let mut prev_underscore = false;
    for c in title.chars() {
        let c = if is_forbidden(c) || c.is_whitespace() {
            '_'
        } else {
            c
        };
        if c == '_' {
            if !prev_underscore {
                stem.push(c);
            }
            prev_underscore = true;
        } else {
            stem.push(c);
            prev_underscore = false;
        }
    }
    let trimmed: String = stem
        .trim_matches(&['_', '.', ' '][..])
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(&['_', '.'][..]);
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_forbidden(c: char) -> bool {
    matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
