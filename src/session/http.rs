//! Session over plain HTTP: each session owns its own client, all sessions share one cookie jar
//! holding the caller's credentials.

use super::{PageLoad, Session, SessionError, SessionFactory, SettleReport};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::Url;
use scraper::{Html, Selector};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) collate/0.1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;

/// Opaque credentials handed over by the login collaborator.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    cookies: Vec<(String, String)>,
}

impl Credentials {
    /// Parse a `name=value; name2=value2` header. Values may themselves contain `=`.
    pub fn from_cookie_header(header: &str) -> Self {
        let cookies = header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { cookies }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Install every cookie into `jar`, scoped to the registrable domain of `scope`.
    fn install(&self, jar: &Jar, scope: &Url) {
        let domain = cookie_domain(scope);
        for (name, value) in &self.cookies {
            let cookie = match &domain {
                Some(d) => format!("{}={}; Domain={}; Path=/", name, value, d),
                None => format!("{}={}; Path=/", name, value),
            };
            jar.add_cookie_str(&cookie, scope);
        }
    }
}

/// `.example.com` for `time.example.com`; `None` (host-only cookie) for IPs and single-label hosts.
fn cookie_domain(url: &Url) -> Option<String> {
    let host = url.domain()?;
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    Some(format!(".{}", labels[labels.len() - 2..].join(".")))
}

/// Text a reader would see: text nodes outside script, style and template elements, with
/// whitespace collapsed.
pub(crate) fn visible_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    for node in doc.root_element().descendants() {
        if let scraper::Node::Text(text) = node.value() {
            let hidden = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| e.name().to_string()))
                .map(|name| matches!(name.as_str(), "script" | "style" | "noscript" | "template"))
                .unwrap_or(false);
            if !hidden {
                out.push_str(text);
                out.push(' ');
            }
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct LoadedPage {
    html: String,
    url: Option<Url>,
}

/// A session backed by one `reqwest::Client`.
pub struct HttpSession {
    client: reqwest::Client,
    page: Option<LoadedPage>,
}

impl HttpSession {
    fn page(&self) -> Result<&LoadedPage, SessionError> {
        self.page.as_ref().ok_or(SessionError::NoPage)
    }

    fn image_sources(&self) -> Vec<Url> {
        let Some(page) = &self.page else {
            return Vec::new();
        };
        let Ok(sel) = Selector::parse("img[src]") else {
            return Vec::new();
        };
        let doc = Html::parse_document(&page.html);
        doc.select(&sel)
            .filter_map(|img| img.value().attr("src"))
            .filter_map(|src| match &page.url {
                Some(base) => base.join(src).ok(),
                None => Url::parse(src).ok(),
            })
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .collect()
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn open(&mut self, url: &Url, timeout: Duration) -> Result<PageLoad, SessionError> {
        let request = async {
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status().as_u16();
            let final_url = response.url().clone();
            let html = response.text().await?;
            Ok::<_, reqwest::Error>((status, final_url, html))
        };
        let (status, final_url, html) = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| SessionError::Timeout {
                what: format!("loading {}", url),
                after: timeout,
            })?
            .map_err(|e| map_reqwest_error(url, e, timeout))?;
        let load = PageLoad {
            status,
            final_url: final_url.to_string(),
        };
        self.page = Some(LoadedPage {
            html,
            url: Some(final_url),
        });
        Ok(load)
    }

    /// A fetched document is static, so readiness is decided by the markup as delivered.
    async fn wait_for_any(
        &mut self,
        selectors: &[String],
        _timeout: Duration,
    ) -> Result<bool, SessionError> {
        let page = self.page()?;
        let doc = Html::parse_document(&page.html);
        for raw in selectors {
            match Selector::parse(raw) {
                Ok(sel) => {
                    if doc.select(&sel).next().is_some() {
                        return Ok(true);
                    }
                }
                Err(e) => debug!(selector = %raw, error = %e, "skipping invalid ready selector"),
            }
        }
        Ok(false)
    }

    async fn page_html(&mut self) -> Result<String, SessionError> {
        Ok(self.page()?.html.clone())
    }

    async fn page_text(&mut self) -> Result<String, SessionError> {
        Ok(visible_text(&self.page()?.html))
    }

    async fn fetch_json(
        &mut self,
        url: &Url,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        let request = async {
            let response = self.client.post(url.clone()).json(body).send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };
        let (status, text) = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| SessionError::Timeout {
                what: format!("waiting for response from {}", url),
                after: timeout,
            })?
            .map_err(|e| map_reqwest_error(url, e, timeout))?;
        if !status.is_success() {
            return Err(SessionError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        serde_json::from_str(&text).map_err(|e| SessionError::InvalidJson {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn load_html(&mut self, html: &str) -> Result<(), SessionError> {
        self.page = Some(LoadedPage {
            html: html.to_string(),
            url: None,
        });
        Ok(())
    }

    /// Probe every remote image with HEAD until `timeout`; unresolved images are reported,
    /// not fatal.
    async fn settle(&mut self, timeout: Duration) -> Result<SettleReport, SessionError> {
        self.page()?;
        let sources = self.image_sources();
        if sources.is_empty() {
            return Ok(SettleReport::default());
        }
        let probed = sources.len();
        let client = &self.client;
        let probes = futures::future::join_all(sources.iter().map(|src| async move {
            matches!(
                client.head(src.clone()).send().await,
                Ok(r) if r.status().is_success()
            )
        }));
        let report = match tokio::time::timeout(timeout, probes).await {
            Ok(outcomes) => SettleReport {
                probed,
                resolved: outcomes.into_iter().filter(|ok| *ok).count(),
                timed_out: false,
            },
            Err(_) => SettleReport {
                probed,
                resolved: 0,
                timed_out: true,
            },
        };
        debug!(
            probed = report.probed,
            resolved = report.resolved,
            timed_out = report.timed_out,
            "settle finished"
        );
        Ok(report)
    }

    async fn print(&mut self, dest: &Path) -> Result<u64, SessionError> {
        let html = &self.page()?.html;
        tokio::fs::write(dest, html.as_bytes())
            .await
            .map_err(|e| SessionError::Io {
                path: dest.to_path_buf(),
                source: e,
            })?;
        Ok(html.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.page = None;
        Ok(())
    }
}

fn map_reqwest_error(url: &Url, e: reqwest::Error, timeout: Duration) -> SessionError {
    if e.is_timeout() {
        return SessionError::Timeout {
            what: format!("loading {}", url),
            after: timeout,
        };
    }
    SessionError::Navigation {
        url: url.to_string(),
        reason: e.to_string(),
    }
}

/// Builds `HttpSession`s that share credentials and client settings.
#[derive(Debug)]
pub struct HttpSessionFactory {
    jar: Arc<Jar>,
    user_agent: String,
    request_timeout: Duration,
}

impl HttpSessionFactory {
    pub fn builder() -> HttpSessionFactoryBuilder {
        HttpSessionFactoryBuilder::default()
    }

    fn build_client(&self) -> Result<reqwest::Client, SessionError> {
        reqwest::Client::builder()
            .cookie_provider(self.jar.clone())
            .user_agent(self.user_agent.clone())
            .timeout(self.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| SessionError::Startup {
                reason: e.to_string(),
            })
    }

    /// A standalone session, used by locators before the pool starts.
    pub fn session(&self) -> Result<HttpSession, SessionError> {
        Ok(HttpSession {
            client: self.build_client()?,
            page: None,
        })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn create(&self) -> Result<Box<dyn Session>, SessionError> {
        Ok(Box::new(self.session()?))
    }
}

/// Builder for `HttpSessionFactory` with optional User-Agent, timeout and credentials.
#[derive(Debug, Default)]
pub struct HttpSessionFactoryBuilder {
    user_agent: Option<String>,
    timeout_secs: Option<u64>,
    credentials: Option<(Credentials, Url)>,
}

impl HttpSessionFactoryBuilder {
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Upper bound for any single request. Default 30.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs.max(1));
        self
    }

    /// Cookies sent with every request to the domain of `scope`.
    pub fn credentials(mut self, credentials: Credentials, scope: Url) -> Self {
        self.credentials = Some((credentials, scope));
        self
    }

    pub fn build(self) -> HttpSessionFactory {
        let jar = Jar::default();
        if let Some((credentials, scope)) = &self.credentials {
            credentials.install(&jar, scope);
        }
        HttpSessionFactory {
            jar: Arc::new(jar),
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            request_timeout: Duration::from_secs(
                self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECS: Duration = Duration::from_secs(5);

    #[test]
    fn cookie_header_parses_pairs_and_keeps_equals_in_values() {
        let c = Credentials::from_cookie_header("SID=abc; token=a=b=c;  ; =bad; GCID=1");
        assert_eq!(c.len(), 3);
        assert_eq!(c.cookies[1], ("token".to_string(), "a=b=c".to_string()));
    }

    #[test]
    fn cookie_domain_uses_last_two_labels() {
        let url = Url::parse("https://time.example.org/column/1").unwrap();
        assert_eq!(cookie_domain(&url).as_deref(), Some(".example.org"));
        let ip = Url::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(cookie_domain(&ip), None);
        let local = Url::parse("http://localhost/").unwrap();
        assert_eq!(cookie_domain(&local), None);
    }

    #[test]
    fn visible_text_skips_scripts() {
        let text = visible_text(
            "<html><body><p>Please  log in</p><script>var login = 1;</script></body></html>",
        );
        assert_eq!(text, "Please log in");
    }

    #[tokio::test]
    async fn open_keeps_body_of_error_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<p>Not here</p>"))
            .mount(&server)
            .await;
        let factory = HttpSessionFactory::builder().build();
        let mut session = factory.session().unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let load = session.open(&url, SECS).await.unwrap();
        assert_eq!(load.status, 404);
        assert!(!load.is_success());
        assert_eq!(session.page_text().await.unwrap(), "Not here");
    }

    #[tokio::test]
    async fn credentials_are_sent_and_ready_selector_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article/1"))
            .and(header("cookie", "SID=abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body><div class=\"content\">Hi</div></body></html>"),
            )
            .mount(&server)
            .await;
        let scope = Url::parse(&server.uri()).unwrap();
        let factory = HttpSessionFactory::builder()
            .credentials(Credentials::from_cookie_header("SID=abc"), scope)
            .build();
        let mut session = factory.create().await.unwrap();
        let url = Url::parse(&format!("{}/article/1", server.uri())).unwrap();
        let load = session.open(&url, SECS).await.unwrap();
        assert_eq!(load.status, 200);
        let ready = session
            .wait_for_any(&["::bad".to_string(), ".content".to_string()], SECS)
            .await
            .unwrap();
        assert!(ready);
        let absent = session
            .wait_for_any(&["article".to_string()], SECS)
            .await
            .unwrap();
        assert!(!absent);
    }

    #[tokio::test]
    async fn fetch_json_resolves_once_and_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":{"list":[]}}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/denied"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let factory = HttpSessionFactory::builder().build();
        let mut session = factory.session().unwrap();
        let ok = Url::parse(&format!("{}/api/list", server.uri())).unwrap();
        let value = session
            .fetch_json(&ok, &serde_json::json!({"cid": 1}), SECS)
            .await
            .unwrap();
        assert!(value["data"]["list"].is_array());
        let denied = Url::parse(&format!("{}/api/denied", server.uri())).unwrap();
        let err = session
            .fetch_json(&denied, &serde_json::json!({}), SECS)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HttpStatus { status: 403, .. }));
    }

    #[tokio::test]
    async fn settle_probes_images_and_print_writes_loaded_page() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/img/ok.png"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/img/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let html = format!(
            "<html><body><img src=\"{0}/img/ok.png\"/><img src=\"{0}/img/gone.png\"/></body></html>",
            server.uri()
        );
        let factory = HttpSessionFactory::builder().build();
        let mut session = factory.session().unwrap();
        assert!(matches!(session.print(Path::new("x")).await, Err(SessionError::NoPage)));
        session.load_html(&html).await.unwrap();
        let report = session.settle(SECS).await.unwrap();
        assert_eq!(report.probed, 2);
        assert_eq!(report.resolved, 1);
        assert!(!report.timed_out);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001_page.html");
        let written = session.print(&dest).await.unwrap();
        assert_eq!(written, html.len() as u64);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), html);
        session.close().await.unwrap();
    }
}
