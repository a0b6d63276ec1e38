//! Rendering sessions. A session is one exclusive page-like context owned by one worker;
//! the pool never hands the same session to two in-flight items.

mod http;

pub use http::{Credentials, HttpSession, HttpSessionFactory, HttpSessionFactoryBuilder};

use async_trait::async_trait;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a session. Callers classify them into an item-level `ErrorKind`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Timed out after {after:?} while {what}")]
    Timeout { what: String, after: Duration },

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Invalid JSON from {url}: {reason}")]
    InvalidJson { url: String, reason: String },

    #[error("No page is loaded in this session")]
    NoPage,

    #[error("Cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not start session: {reason}")]
    Startup { reason: String },
}

/// Outcome of navigating a session to an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLoad {
    pub status: u16,
    pub final_url: String,
}

impl PageLoad {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What a best-effort settle wait observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub probed: usize,
    pub resolved: usize,
    pub timed_out: bool,
}

/// One rendering context: navigates, exposes the current page, loads prepared markup and
/// prints it to an artifact file.
#[async_trait]
pub trait Session: Send {
    /// Navigate to `url`. Non-success statuses are returned in `PageLoad`, not as errors,
    /// so the page body stays available for classification.
    async fn open(&mut self, url: &Url, timeout: Duration) -> Result<PageLoad, SessionError>;

    /// Wait until one of `selectors` matches the current page, or `timeout` elapses.
    async fn wait_for_any(
        &mut self,
        selectors: &[String],
        timeout: Duration,
    ) -> Result<bool, SessionError>;

    async fn page_html(&mut self) -> Result<String, SessionError>;

    /// Visible text of the current page.
    async fn page_text(&mut self) -> Result<String, SessionError>;

    /// Issue one API request and resolve with its JSON body. Resolves exactly once.
    async fn fetch_json(
        &mut self,
        url: &Url,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError>;

    /// Replace the current page with prepared markup.
    async fn load_html(&mut self, html: &str) -> Result<(), SessionError>;

    /// Give asynchronous resources of the loaded page up to `timeout` to settle.
    async fn settle(&mut self, timeout: Duration) -> Result<SettleReport, SessionError>;

    /// Write the loaded page to `dest`; returns bytes written.
    async fn print(&mut self, dest: &Path) -> Result<u64, SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Creates sessions for pool workers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Session>, SessionError>;
}
