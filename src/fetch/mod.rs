//! Item fetching: navigate a session to an item, wait for its content, classify failures and
//! retry retryable ones with linear backoff.

mod classify;

pub use classify::{FailureClassifier, KeywordClassifier, MarkerTable};

use crate::model::{ErrorKind, ItemDescriptor, RawContent};
use crate::session::Session;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(30);

/// Selectors that mark a page's content as ready.
pub const DEFAULT_READY_SELECTORS: &[&str] = &[
    "[class*=\"articleContent\"]",
    ".article-content",
    "article",
    ".content",
];

/// Final failure of a fetch, after retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message} (after {attempts} attempt(s))")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Retry and timeout policy for one item.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Budget for one attempt: navigation plus content-ready wait.
    pub timeout: Duration,
    pub ready_selectors: Vec<String>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            timeout: DEFAULT_ITEM_TIMEOUT,
            ready_selectors: DEFAULT_READY_SELECTORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl FetchPolicy {
    /// Delay before the attempt following `attempt` (1-based): `attempt × base_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Successful fetch with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub raw: RawContent,
    pub attempts: u32,
}

struct AttemptFailure {
    kind: ErrorKind,
    message: String,
}

impl AttemptFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub struct ItemFetcher {
    policy: FetchPolicy,
    classifier: Arc<dyn FailureClassifier>,
}

impl ItemFetcher {
    pub fn new(mut policy: FetchPolicy, classifier: Arc<dyn FailureClassifier>) -> Self {
        policy.max_attempts = policy.max_attempts.max(1);
        Self { policy, classifier }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetch `item` through `session`. Authorization failures are returned after the first attempt.
    pub async fn fetch(
        &self,
        session: &mut dyn Session,
        item: &ItemDescriptor,
    ) -> Result<Fetched, FetchError> {
        let url = Url::parse(&item.address).map_err(|e| FetchError {
            kind: ErrorKind::Unknown,
            message: format!("invalid address {:?}: {}", item.address, e),
            attempts: 0,
        })?;

        let mut attempt = 1;
        loop {
            let outcome = tokio::time::timeout(self.policy.timeout, self.attempt(session, &url))
                .await
                .unwrap_or_else(|_| {
                    Err(AttemptFailure::new(
                        ErrorKind::Timeout,
                        format!("no content within {:?}", self.policy.timeout),
                    ))
                });
            match outcome {
                Ok(raw) => {
                    return Ok(Fetched {
                        raw,
                        attempts: attempt,
                    })
                }
                Err(failure) => {
                    if !failure.kind.is_retryable() || attempt >= self.policy.max_attempts {
                        return Err(FetchError {
                            kind: failure.kind,
                            message: failure.message,
                            attempts: attempt,
                        });
                    }
                    let backoff = self.policy.backoff(attempt);
                    debug!(
                        index = item.original_index,
                        attempt,
                        kind = %failure.kind,
                        ?backoff,
                        "fetch attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        session: &mut dyn Session,
        url: &Url,
    ) -> Result<RawContent, AttemptFailure> {
        let timeout = self.policy.timeout;
        let load = session
            .open(url, timeout)
            .await
            .map_err(|e| {
                AttemptFailure::new(self.classifier.classify_session_error(&e), e.to_string())
            })?;

        if !load.is_success() {
            let by_status = self.classifier.classify_status(load.status);
            let kind = if by_status == ErrorKind::Unknown {
                self.page_kind(session).await.unwrap_or(by_status)
            } else {
                by_status
            };
            return Err(AttemptFailure::new(
                kind,
                format!("HTTP {} from {}", load.status, load.final_url),
            ));
        }

        let ready = self.policy.ready_selectors.is_empty()
            || session
                .wait_for_any(&self.policy.ready_selectors, timeout)
                .await
                .map_err(|e| {
                    AttemptFailure::new(self.classifier.classify_session_error(&e), e.to_string())
                })?;
        if !ready {
            return Err(match self.page_kind(session).await {
                Some(kind) => AttemptFailure::new(
                    kind,
                    format!("page at {} shows a {} marker", load.final_url, kind),
                ),
                None => AttemptFailure::new(
                    ErrorKind::Timeout,
                    format!("content never became ready at {}", load.final_url),
                ),
            });
        }

        let html = session
            .page_html()
            .await
            .map_err(|e| AttemptFailure::new(ErrorKind::Unknown, e.to_string()))?;
        Ok(RawContent {
            html,
            source_url: load.final_url,
        })
    }

    async fn page_kind(&self, session: &mut dyn Session) -> Option<ErrorKind> {
        let text = session.page_text().await.ok()?;
        self.classifier.classify_page(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PageLoad, SessionError, SettleReport};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;

    /// Replays one scripted page per `open` call; the last one repeats.
    struct ScriptedSession {
        pages: VecDeque<Result<(u16, String), ()>>,
        current: Option<String>,
        opens: u32,
    }

    impl ScriptedSession {
        fn new(pages: Vec<Result<(u16, &str), ()>>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|p| p.map(|(s, h)| (s, h.to_string())))
                    .collect(),
                current: None,
                opens: 0,
            }
        }
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn open(&mut self, url: &Url, timeout: Duration) -> Result<PageLoad, SessionError> {
            self.opens += 1;
            let next = if self.pages.len() > 1 {
                self.pages.pop_front()
            } else {
                self.pages.front().cloned()
            };
            match next {
                Some(Ok((status, html))) => {
                    self.current = Some(html);
                    Ok(PageLoad {
                        status,
                        final_url: url.to_string(),
                    })
                }
                _ => Err(SessionError::Timeout {
                    what: "loading".to_string(),
                    after: timeout,
                }),
            }
        }

        async fn wait_for_any(
            &mut self,
            selectors: &[String],
            _timeout: Duration,
        ) -> Result<bool, SessionError> {
            let html = self.current.as_deref().unwrap_or("");
            Ok(selectors.iter().any(|s| html.contains(s.trim_start_matches('.'))))
        }

        async fn page_html(&mut self) -> Result<String, SessionError> {
            self.current.clone().ok_or(SessionError::NoPage)
        }

        async fn page_text(&mut self) -> Result<String, SessionError> {
            self.current.clone().ok_or(SessionError::NoPage)
        }

        async fn fetch_json(
            &mut self,
            _url: &Url,
            _body: &serde_json::Value,
            _timeout: Duration,
        ) -> Result<serde_json::Value, SessionError> {
            Err(SessionError::NoPage)
        }

        async fn load_html(&mut self, html: &str) -> Result<(), SessionError> {
            self.current = Some(html.to_string());
            Ok(())
        }

        async fn settle(&mut self, _timeout: Duration) -> Result<SettleReport, SessionError> {
            Ok(SettleReport::default())
        }

        async fn print(&mut self, _dest: &Path) -> Result<u64, SessionError> {
            Ok(0)
        }

        async fn close(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn item() -> ItemDescriptor {
        ItemDescriptor {
            id: "1".to_string(),
            title: "One".to_string(),
            address: "https://example.com/article/1".to_string(),
            section_label: None,
            original_index: 0,
        }
    }

    fn fetcher(max_attempts: u32) -> ItemFetcher {
        let policy = FetchPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            ready_selectors: vec![".content".to_string()],
        };
        ItemFetcher::new(policy, Arc::new(KeywordClassifier::default()))
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = FetchPolicy {
            base_delay: Duration::from_millis(500),
            ..FetchPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn ready_page_is_returned_on_first_attempt() {
        let mut session = ScriptedSession::new(vec![Ok((200, "<div class=\"content\">x</div>"))]);
        let fetched = fetcher(3).fetch(&mut session, &item()).await.unwrap();
        assert_eq!(fetched.attempts, 1);
        assert!(fetched.raw.html.contains("content"));
        assert_eq!(fetched.raw.source_url, "https://example.com/article/1");
    }

    #[tokio::test]
    async fn auth_wall_is_never_retried() {
        let mut session = ScriptedSession::new(vec![Ok((200, "<p>Please log in to read</p>"))]);
        let err = fetcher(3).fetch(&mut session, &item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthOrPermission);
        assert_eq!(err.attempts, 1);
        assert_eq!(session.opens, 1);
    }

    #[tokio::test]
    async fn forbidden_status_is_terminal() {
        let mut session = ScriptedSession::new(vec![Ok((403, "denied"))]);
        let err = fetcher(5).fetch(&mut session, &item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthOrPermission);
        assert_eq!(session.opens, 1);
    }

    #[tokio::test]
    async fn timeouts_exhaust_all_attempts() {
        let mut session = ScriptedSession::new(vec![Err(())]);
        let err = fetcher(3).fetch(&mut session, &item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.attempts, 3);
        assert_eq!(session.opens, 3);
    }

    #[tokio::test]
    async fn missing_content_is_a_timeout_and_recovers_on_retry() {
        let mut session = ScriptedSession::new(vec![
            Ok((200, "<p>loading…</p>")),
            Ok((200, "<div class=\"content\">ready</div>")),
        ]);
        let fetched = fetcher(3).fetch(&mut session, &item()).await.unwrap();
        assert_eq!(fetched.attempts, 2);
    }

    #[tokio::test]
    async fn not_found_is_retried_up_to_limit() {
        let mut session = ScriptedSession::new(vec![Ok((404, "gone"))]);
        let err = fetcher(2).fetch(&mut session, &item()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn invalid_address_fails_without_attempts() {
        let mut session = ScriptedSession::new(vec![Ok((200, "content"))]);
        let mut bad = item();
        bad.address = "not a url".to_string();
        let err = fetcher(3).fetch(&mut session, &bad).await.unwrap_err();
        assert_eq!(err.attempts, 0);
        assert_eq!(session.opens, 0);
    }

    #[tokio::test]
    async fn zero_attempts_is_clamped_to_one() {
        let mut session = ScriptedSession::new(vec![Err(())]);
        let f = fetcher(0);
        assert_eq!(f.policy().max_attempts, 1);
        let err = f.fetch(&mut session, &item()).await.unwrap_err();
        assert_eq!(err.attempts, 1);
    }
}
