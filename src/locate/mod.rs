//! Source locators turn a collection reference into an ordered list of items.

mod listing;

pub use listing::{
    document_title, parse_listing, title_from_page, Listing, ListingApiLocator,
    DEFAULT_ADDRESS_TEMPLATE, DEFAULT_COLLECTION_TITLE, DEFAULT_LISTING_ENDPOINT,
};

use crate::model::{Collection, ItemDescriptor};
use crate::session::{Session, SessionError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("Invalid collection reference '{input}': {reason}")]
    InvalidCollection { input: String, reason: String },

    #[error("Listing request failed: {0}")]
    Session(#[from] SessionError),

    #[error("Unexpected listing response: {reason}")]
    MalformedListing { reason: String },

    #[error("Cannot read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest {path}: {source}")]
    ManifestFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Collection '{collection}' has no items")]
    EmptyCollection { collection: String },
}

/// Produces the ordered item list of a collection.
///
/// Items come back with `original_index` equal to their position.
#[async_trait]
pub trait SourceLocator: Send + Sync {
    async fn locate(
        &self,
        session: &mut dyn Session,
        collection: &str,
    ) -> Result<Collection, LocateError>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    title: String,
    items: Vec<ManifestItem>,
}

#[derive(Debug, Deserialize)]
struct ManifestItem {
    id: String,
    title: String,
    address: String,
    #[serde(default)]
    section: Option<String>,
}

/// Reads a JSON manifest; the collection reference is the manifest path.
///
/// ```json
/// { "title": "Course",
///   "items": [{ "id": "1", "title": "Intro", "address": "https://...", "section": "Part 1" }] }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestLocator;

impl ManifestLocator {
    pub fn parse(path: PathBuf, text: &str) -> Result<Collection, LocateError> {
        let manifest: Manifest =
            serde_json::from_str(text).map_err(|e| LocateError::ManifestFormat {
                path: path.clone(),
                source: e,
            })?;
        if manifest.items.is_empty() {
            return Err(LocateError::EmptyCollection {
                collection: path.display().to_string(),
            });
        }
        let items = manifest
            .items
            .into_iter()
            .enumerate()
            .map(|(original_index, item)| ItemDescriptor {
                id: item.id,
                title: item.title,
                address: item.address,
                section_label: item.section.filter(|s| !s.trim().is_empty()),
                original_index,
            })
            .collect();
        let title = match manifest.title.trim() {
            "" => DEFAULT_COLLECTION_TITLE.to_string(),
            t => t.to_string(),
        };
        Ok(Collection { title, items })
    }
}

#[async_trait]
impl SourceLocator for ManifestLocator {
    async fn locate(
        &self,
        _session: &mut dyn Session,
        collection: &str,
    ) -> Result<Collection, LocateError> {
        let path = PathBuf::from(collection);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| LocateError::ManifestRead {
                path: path.clone(),
                source: e,
            })?;
        let collection = Self::parse(path, &text)?;
        info!(items = collection.items.len(), title = %collection.title, "manifest loaded");
        Ok(collection)
    }
}
