//! Failure classification. Turns statuses, session errors and page text into an `ErrorKind`
//! at the point of failure. The keyword tables are configuration.

use crate::model::ErrorKind;
use crate::session::SessionError;

const DEFAULT_AUTH_MARKERS: &[&str] = &[
    "请登录",
    "登录后",
    "立即登录",
    "购买后",
    "订阅后",
    "付费",
    "please log in",
    "log in to",
    "sign in to",
    "purchase",
    "subscribe to read",
    "subscribers only",
    "quota exceeded",
    "too many requests",
    "access denied",
];

const DEFAULT_NOT_FOUND_MARKERS: &[&str] = &[
    "页面不存在",
    "文章不存在",
    "已下架",
    "page not found",
    "404 not found",
    "does not exist",
];

/// Keyword tables matched case-insensitively against visible page text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerTable {
    pub auth: Vec<String>,
    pub not_found: Vec<String>,
}

impl Default for MarkerTable {
    fn default() -> Self {
        Self {
            auth: DEFAULT_AUTH_MARKERS.iter().map(|s| s.to_string()).collect(),
            not_found: DEFAULT_NOT_FOUND_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl MarkerTable {
    /// Replace a table only when the override is given.
    pub fn with_overrides(
        mut self,
        auth: Option<Vec<String>>,
        not_found: Option<Vec<String>>,
    ) -> Self {
        if let Some(a) = auth {
            self.auth = a;
        }
        if let Some(n) = not_found {
            self.not_found = n;
        }
        self
    }
}

/// Pluggable classification step used by the fetcher.
pub trait FailureClassifier: Send + Sync {
    fn classify_status(&self, status: u16) -> ErrorKind;

    /// Kind suggested by the page text, if any marker matches.
    fn classify_page(&self, text: &str) -> Option<ErrorKind>;

    fn classify_session_error(&self, err: &SessionError) -> ErrorKind;
}

/// Default classifier: status code table plus keyword markers.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    markers: MarkerTable,
}

impl KeywordClassifier {
    pub fn new(markers: MarkerTable) -> Self {
        let lower = |v: Vec<String>| {
            v.into_iter()
                .map(|m| m.to_lowercase())
                .filter(|m| !m.trim().is_empty())
                .collect()
        };
        Self {
            markers: MarkerTable {
                auth: lower(markers.auth),
                not_found: lower(markers.not_found),
            },
        }
    }
}

impl FailureClassifier for KeywordClassifier {
    fn classify_status(&self, status: u16) -> ErrorKind {
        match status {
            401 | 402 | 403 | 407 | 429 | 451 => ErrorKind::AuthOrPermission,
            404 | 410 => ErrorKind::NotFound,
            408 | 504 => ErrorKind::Timeout,
            _ => ErrorKind::Unknown,
        }
    }

    fn classify_page(&self, text: &str) -> Option<ErrorKind> {
        let text = text.to_lowercase();
        if self.markers.auth.iter().any(|m| text.contains(m.as_str())) {
            return Some(ErrorKind::AuthOrPermission);
        }
        if self.markers.not_found.iter().any(|m| text.contains(m.as_str())) {
            return Some(ErrorKind::NotFound);
        }
        None
    }

    fn classify_session_error(&self, err: &SessionError) -> ErrorKind {
        match err {
            SessionError::Timeout { .. } => ErrorKind::Timeout,
            SessionError::HttpStatus { status, .. } => self.classify_status(*status),
            _ => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn statuses_map_to_kinds() {
        let c = KeywordClassifier::default();
        assert_eq!(c.classify_status(403), ErrorKind::AuthOrPermission);
        assert_eq!(c.classify_status(401), ErrorKind::AuthOrPermission);
        assert_eq!(c.classify_status(429), ErrorKind::AuthOrPermission);
        assert_eq!(c.classify_status(404), ErrorKind::NotFound);
        assert_eq!(c.classify_status(504), ErrorKind::Timeout);
        assert_eq!(c.classify_status(500), ErrorKind::Unknown);
    }

    #[test]
    fn default_markers_match_case_insensitively() {
        let c = KeywordClassifier::new(MarkerTable::default());
        assert_eq!(
            c.classify_page("Please LOG IN to continue reading"),
            Some(ErrorKind::AuthOrPermission)
        );
        assert_eq!(c.classify_page("抱歉，文章不存在"), Some(ErrorKind::NotFound));
        assert_eq!(c.classify_page("An ordinary article body"), None);
    }

    #[test]
    fn auth_markers_win_over_not_found() {
        let c = KeywordClassifier::new(MarkerTable::default());
        assert_eq!(
            c.classify_page("page not found. please log in"),
            Some(ErrorKind::AuthOrPermission)
        );
    }

    #[test]
    fn overrides_replace_tables() {
        let table = MarkerTable::default()
            .with_overrides(Some(vec!["Members Only".to_string(), "  ".to_string()]), None);
        let c = KeywordClassifier::new(table);
        assert_eq!(c.classify_page("members only area"), Some(ErrorKind::AuthOrPermission));
        assert_eq!(c.classify_page("please log in"), None);
        assert_eq!(c.classify_page("page not found"), Some(ErrorKind::NotFound));
    }

    #[test]
    fn session_errors_classify() {
        let c = KeywordClassifier::default();
        let timeout = SessionError::Timeout {
            what: "loading".to_string(),
            after: Duration::from_secs(1),
        };
        assert_eq!(c.classify_session_error(&timeout), ErrorKind::Timeout);
        let status = SessionError::HttpStatus {
            status: 404,
            url: "u".to_string(),
        };
        assert_eq!(c.classify_session_error(&status), ErrorKind::NotFound);
        assert_eq!(c.classify_session_error(&SessionError::NoPage), ErrorKind::Unknown);
    }
}
