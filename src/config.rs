//! Optional config file loading. Search order: `--config <path>`, then ./collate.toml, then
//! $XDG_CONFIG_HOME/collate/config.toml (or ~/.config/collate/config.toml).

use crate::merge::OutputFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot determine current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("Config file {path} does not exist")]
    NotFound { path: PathBuf },

    #[error("Cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct Config {
    /// Collection id or address used when none is given on the command line.
    pub collection_url: Option<String>,
    /// Cookie header (`name=value; name2=value2`) for authenticated collections.
    pub cookie: Option<String>,
    /// Output directory when -o is not set. Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    /// Number of workers (default 3).
    pub concurrency: Option<usize>,
    /// Pause each worker takes between items, in milliseconds (default 2000).
    pub delay_ms: Option<u64>,
    /// Per-attempt fetch timeout in seconds (default 30).
    pub timeout_secs: Option<u64>,
    /// Fetch attempts per item, first one included (default 3).
    pub max_attempts: Option<u32>,
    /// Linear backoff unit between attempts, in milliseconds (default 1000).
    pub retry_base_delay_ms: Option<u64>,
    /// How long a rendered item may settle before printing, in milliseconds (default 1500).
    pub settle_ms: Option<u64>,
    pub listing_endpoint: Option<String>,
    /// Item address with an `{id}` placeholder.
    pub item_address_template: Option<String>,
    /// Where the readable body of an item lives, tried in order.
    pub content_selectors: Option<Vec<String>>,
    /// Selectors whose presence means an item page has finished loading.
    pub ready_selectors: Option<Vec<String>>,
    /// Page text that marks a login or purchase wall.
    pub auth_markers: Option<Vec<String>>,
    /// Page text that marks a missing item.
    pub not_found_markers: Option<Vec<String>>,
    pub formats: Option<Vec<OutputFormat>>,
    pub delete_after_merge: Option<bool>,
}

/// Load the config from `explicit` if given (it must exist), otherwise from the first
/// default location that exists. No file at a default location returns Ok(None).
pub fn load_config(explicit: Option<&Path>) -> Result<Option<Config>, ConfigError> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        return read_config(path).map(Some);
    }
    let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
    let mut paths = vec![cwd.join("collate.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("collate").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            return read_config(path).map(Some);
        }
    }
    Ok(None)
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&s).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let c: Config = toml::from_str("").unwrap();
        assert!(c.collection_url.is_none());
        assert!(c.output_dir.is_none());
        assert!(c.concurrency.is_none());
        assert!(c.formats.is_none());
        assert!(c.delete_after_merge.is_none());
    }

    #[test]
    fn parse_full_config() {
        let s = r#"
            collection_url = "https://example.com/column/intro/100017301"
            cookie = "SID=abc; token=x=y"
            output_dir = "out"
            user_agent = "Custom/1.0"
            concurrency = 5
            delay_ms = 500
            timeout_secs = 60
            max_attempts = 4
            retry_base_delay_ms = 250
            settle_ms = 0
            listing_endpoint = "https://example.com/api/list"
            item_address_template = "https://example.com/article/{id}"
            content_selectors = [".post-body"]
            ready_selectors = [".post-body", "article"]
            auth_markers = ["subscribe to read"]
            not_found_markers = ["gone"]
            formats = ["html", "epub", "md"]
            delete_after_merge = true
        "#;
        let c: Config = toml::from_str(s).unwrap();
        assert_eq!(c.output_dir.as_deref(), Some(Path::new("out")));
        assert_eq!(c.cookie.as_deref(), Some("SID=abc; token=x=y"));
        assert_eq!(c.concurrency, Some(5));
        assert_eq!(c.delay_ms, Some(500));
        assert_eq!(c.max_attempts, Some(4));
        assert_eq!(c.settle_ms, Some(0));
        assert_eq!(
            c.item_address_template.as_deref(),
            Some("https://example.com/article/{id}")
        );
        assert_eq!(c.ready_selectors.as_ref().map(Vec::len), Some(2));
        assert_eq!(c.auth_markers.as_deref(), Some(["subscribe to read".to_string()].as_slice()));
        assert_eq!(
            c.formats,
            Some(vec![OutputFormat::Html, OutputFormat::Epub, OutputFormat::Markdown])
        );
        assert_eq!(c.delete_after_merge, Some(true));
    }

    #[test]
    fn parse_partial_config() {
        let c: Config = toml::from_str("delay_ms = 1").unwrap();
        assert_eq!(c.delay_ms, Some(1));
        assert!(c.timeout_secs.is_none());
    }

    #[test]
    fn invalid_toml_errors() {
        assert!(toml::from_str::<Config>("output_dir = [").is_err());
        assert!(toml::from_str::<Config>("formats = [\"pdf\"]").is_err());
        assert!(toml::from_str::<Config>("concurency = 3").is_err());
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            load_config(Some(&missing)),
            Err(ConfigError::NotFound { .. })
        ));

        let present = dir.path().join("collate.toml");
        std::fs::write(&present, "concurrency = 2").unwrap();
        let c = load_config(Some(&present)).unwrap().unwrap();
        assert_eq!(c.concurrency, Some(2));

        std::fs::write(&present, "concurrency = \"two\"").unwrap();
        let err = load_config(Some(&present)).unwrap_err();
        assert!(err.to_string().contains("collate.toml"));
    }
}
