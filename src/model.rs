//! Data model shared by every pipeline stage.
//!
//! `ItemDescriptor` is produced once by a locator and never mutated; its `original_index`
//! is the only ordering key used by rendering, merging and the outline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One item of a collection, in collection order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub id: String,
    pub title: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_label: Option<String>,
    /// 0-based position in the collection.
    pub original_index: usize,
}

/// An ordered collection as returned by a locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub title: String,
    pub items: Vec<ItemDescriptor>,
}

impl Collection {
    /// Keep only the first `limit` items. Indices are already dense, so nothing is renumbered.
    pub fn truncate(&mut self, limit: usize) {
        self.items.truncate(limit);
    }
}

/// Content retrieved for one item, before sanitization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub html: String,
    pub source_url: String,
}

/// Closed failure taxonomy for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    AuthOrPermission,
    NotFound,
    EmptyContent,
    RenderFailure,
    Unknown,
    /// The run was aborted before this item finished.
    Cancelled,
}

impl ErrorKind {
    /// Kinds for which another fetch attempt may change the outcome.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::NotFound | ErrorKind::Unknown
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::AuthOrPermission => "auth-or-permission",
            ErrorKind::NotFound => "not-found",
            ErrorKind::EmptyContent => "empty-content",
            ErrorKind::RenderFailure => "render-failure",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A rendered per-item artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Rendered(ArtifactHandle),
    Failed { kind: ErrorKind, message: String },
}

/// Result slot for one item. Written exactly once, at `original_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub original_index: usize,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_label: Option<String>,
    /// Fetch attempts made for this item (0 if it was never fetched).
    pub attempts: u32,
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn rendered(item: &ItemDescriptor, attempts: u32, artifact: ArtifactHandle) -> Self {
        Self {
            original_index: item.original_index,
            title: item.title.clone(),
            section_label: item.section_label.clone(),
            attempts,
            outcome: ItemOutcome::Rendered(artifact),
        }
    }

    pub fn failed(
        item: &ItemDescriptor,
        attempts: u32,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            original_index: item.original_index,
            title: item.title.clone(),
            section_label: item.section_label.clone(),
            attempts,
            outcome: ItemOutcome::Failed {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn cancelled(item: &ItemDescriptor) -> Self {
        Self::failed(item, 0, ErrorKind::Cancelled, "run aborted before item completed")
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Rendered(_))
    }

    pub fn artifact(&self) -> Option<&ArtifactHandle> {
        match &self.outcome {
            ItemOutcome::Rendered(a) => Some(a),
            ItemOutcome::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ItemOutcome::Rendered(_) => None,
            ItemOutcome::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            ItemOutcome::Rendered(_) => None,
            ItemOutcome::Failed { message, .. } => Some(message),
        }
    }
}

/// One entry of a deliverable's navigable outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub title: String,
    /// Byte offset of the item's section within the merged content stream.
    pub position: usize,
    pub anchor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_label: Option<String>,
}

/// A merged deliverable written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedDeliverable {
    pub path: PathBuf,
    pub item_count: usize,
    /// Empty when outline construction failed; see `warnings`.
    pub outline: Vec<OutlineEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Progress event published after every completed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub original_index: usize,
    pub last_item_title: String,
    pub last_item_success: bool,
    /// Failure message for the item, if it failed.
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn item() -> ItemDescriptor {
        ItemDescriptor {
            id: "200822".to_string(),
            title: "01 | Why concurrency".to_string(),
            address: "https://example.com/article/200822".to_string(),
            section_label: Some("Basics".to_string()),
            original_index: 4,
        }
    }

    #[test]
    fn retryable_kinds_match_propagation_policy() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::NotFound.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::AuthOrPermission.is_retryable());
        assert!(!ErrorKind::EmptyContent.is_retryable());
        assert!(!ErrorKind::RenderFailure.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn failed_result_keeps_index_and_kind() {
        let r = ItemResult::failed(&item(), 1, ErrorKind::AuthOrPermission, "login wall");
        assert_eq!(r.original_index, 4);
        assert!(!r.is_success());
        assert_eq!(r.error_kind(), Some(ErrorKind::AuthOrPermission));
        assert_eq!(r.error_message(), Some("login wall"));
        assert!(r.artifact().is_none());
        assert_eq!(r.section_label.as_deref(), Some("Basics"));
    }

    #[test]
    fn cancelled_result_has_no_attempts() {
        let r = ItemResult::cancelled(&item());
        assert_eq!(r.attempts, 0);
        assert_eq!(r.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn item_result_serializes_outcome() -> Result<(), Box<dyn Error>> {
        let r = ItemResult::rendered(
            &item(),
            2,
            ArtifactHandle {
                path: PathBuf::from("out/005_x.html"),
                bytes: 10,
            },
        );
        let json = serde_json::to_string(&r)?;
        assert!(json.contains("\"original_index\":4"));
        assert!(json.contains("\"Rendered\""));
        let back: ItemResult = serde_json::from_str(&json)?;
        assert_eq!(back, r);
        Ok(())
    }

    #[test]
    fn error_kind_display_is_kebab_case() {
        assert_eq!(ErrorKind::AuthOrPermission.to_string(), "auth-or-permission");
        assert_eq!(ErrorKind::EmptyContent.to_string(), "empty-content");
    }
}
