//! Locator for collections exposed through a paged JSON listing endpoint.

use super::{LocateError, SourceLocator};
use crate::model::{Collection, ItemDescriptor};
use crate::session::Session;
use async_trait::async_trait;
use reqwest::Url;
use scraper::Html;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LISTING_ENDPOINT: &str = "https://time.geekbang.org/serv/v1/column/articles";
pub const DEFAULT_ADDRESS_TEMPLATE: &str = "https://time.geekbang.org/column/article/{id}";
pub const DEFAULT_COLLECTION_TITLE: &str = "Collection";

const DEFAULT_PAGE_SIZE: u32 = 500;
const DEFAULT_LISTING_TIMEOUT: Duration = Duration::from_secs(10);
const TITLE_KEYS: &[&str] = &["column_title", "column_subtitle", "title", "name", "columnTitle"];
const ITEM_TITLE_KEYS: &[&str] = &["column_title", "product_title"];

/// Parsed `data` of a listing response. `title` is `None` when the response names no title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub title: Option<String>,
    pub items: Vec<ItemDescriptor>,
}

pub struct ListingApiLocator {
    endpoint: Url,
    address_template: String,
    page_size: u32,
    timeout: Duration,
}

impl ListingApiLocator {
    pub fn new(endpoint: Url, address_template: impl Into<String>) -> Self {
        Self {
            endpoint,
            address_template: address_template.into(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: DEFAULT_LISTING_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    fn request_body(&self, collection_id: &str) -> Value {
        let cid = match collection_id.parse::<u64>() {
            Ok(n) => json!(n),
            Err(_) => json!(collection_id),
        };
        json!({
            "cid": cid,
            "size": self.page_size,
            "prev": 0,
            "order": "earliest",
            "sample": false,
        })
    }

    /// `<title>` of the collection page, when `collection` is an address that can be opened.
    async fn page_title(&self, session: &mut dyn Session, collection: &str) -> Option<String> {
        let url = Url::parse(collection).ok()?;
        match session.open(&url, self.timeout).await {
            Ok(load) if load.is_success() => {}
            Ok(load) => {
                debug!(status = load.status, url = %url, "collection page unavailable");
                return None;
            }
            Err(e) => {
                debug!(error = %e, url = %url, "collection page unavailable");
                return None;
            }
        }
        let html = session.page_html().await.ok()?;
        document_title(&html)
    }
}

#[async_trait]
impl SourceLocator for ListingApiLocator {
    async fn locate(
        &self,
        session: &mut dyn Session,
        collection: &str,
    ) -> Result<Collection, LocateError> {
        let id = collection_id(collection)?;
        let body = self.request_body(&id);
        debug!(endpoint = %self.endpoint, cid = %id, "requesting listing");
        let response = session.fetch_json(&self.endpoint, &body, self.timeout).await?;
        let listing = parse_listing(&response, &self.address_template)?;
        if listing.items.is_empty() {
            return Err(LocateError::EmptyCollection {
                collection: collection.to_string(),
            });
        }

        let title = match listing.title {
            Some(t) => t,
            None => {
                let page = self.page_title(session, collection).await;
                match page.as_deref().and_then(title_from_page) {
                    Some(t) => t,
                    None => {
                        warn!(collection, "no collection title found, using default");
                        DEFAULT_COLLECTION_TITLE.to_string()
                    }
                }
            }
        };
        info!(items = listing.items.len(), title = %title, "listing loaded");
        Ok(Collection {
            title,
            items: listing.items,
        })
    }
}

/// Collection id from a bare id or from the last path segment of a collection address.
fn collection_id(collection: &str) -> Result<String, LocateError> {
    let trimmed = collection.trim();
    let id = match Url::parse(trimmed) {
        Ok(url) => url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => trimmed.to_string(),
    };
    if id.is_empty() || id.contains(char::is_whitespace) {
        return Err(LocateError::InvalidCollection {
            input: collection.to_string(),
            reason: "expected a collection id or an address ending in one".to_string(),
        });
    }
    Ok(id)
}

/// Parse `data.list[]` of a listing response into ordered items.
///
/// Item titles fall back from `article_title` to `article_sharetitle` to `Untitled`; item
/// addresses are `address_template` with `{id}` substituted.
pub fn parse_listing(response: &Value, address_template: &str) -> Result<Listing, LocateError> {
    let data = response
        .get("data")
        .filter(|d| d.is_object())
        .ok_or_else(|| LocateError::MalformedListing {
            reason: "missing 'data' object".to_string(),
        })?;
    let list = data
        .get("list")
        .and_then(Value::as_array)
        .ok_or_else(|| LocateError::MalformedListing {
            reason: "missing 'data.list' array".to_string(),
        })?;

    let mut items = Vec::with_capacity(list.len());
    for (original_index, entry) in list.iter().enumerate() {
        let id = entry
            .get("id")
            .and_then(scalar_string)
            .ok_or_else(|| LocateError::MalformedListing {
                reason: format!("entry {} has no id", original_index),
            })?;
        let title = ["article_title", "article_sharetitle"]
            .iter()
            .find_map(|k| non_blank(entry.get(*k)))
            .unwrap_or_else(|| "Untitled".to_string());
        items.push(ItemDescriptor {
            address: address_template.replace("{id}", &id),
            id,
            title,
            section_label: None,
            original_index,
        });
    }

    let title = TITLE_KEYS
        .iter()
        .find_map(|k| non_blank(data.get(*k)))
        .or_else(|| {
            let first = list.first()?;
            ITEM_TITLE_KEYS.iter().find_map(|k| non_blank(first.get(*k)))
        })
        .filter(|t| t != DEFAULT_COLLECTION_TITLE);

    Ok(Listing { title, items })
}

/// Second `-`-separated segment of a page title such as `Lesson - Course - Site`.
pub fn title_from_page(page_title: &str) -> Option<String> {
    let parts: Vec<&str> = page_title.split('-').map(str::trim).collect();
    if parts.len() < 2 || parts[1].is_empty() {
        return None;
    }
    Some(parts[1].to_string())
}

/// Text of the document's `<title>` element.
pub fn document_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let title = doc
        .root_element()
        .descendants()
        .filter_map(scraper::ElementRef::wrap)
        .find(|el| el.value().name() == "title")?;
    let text = title.text().collect::<String>();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn non_blank(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
