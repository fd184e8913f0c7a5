//! Repository configuration
//!
//! Connection settings for the HTTP backend plus the query compiler options
//! (range indexes, fulltext, trash convention).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::WireType;
use crate::query::{CompilerConfig, TrashMode};

/// Default number of documents fetched per streamed page.
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Default keep-alive of an idle scroll cursor.
pub const DEFAULT_SCROLL_KEEP_ALIVE_SECS: u64 = 60;

/// Configuration for a tree-document repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Backend base URL (e.g., "https://docs.internal:8443")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Require TLS; plain `http://` endpoints are rejected when set
    #[serde(default)]
    pub tls: bool,
    /// Range-indexed fields and their wire type
    #[serde(default)]
    pub range_indexes: BTreeMap<String, WireType>,
    #[serde(default)]
    pub fulltext_disabled: bool,
    #[serde(default)]
    pub trash_mode: TrashMode,
    /// Documents per page when streaming results
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Keep-alive of idle scroll cursors, in seconds
    #[serde(default = "default_keep_alive")]
    pub scroll_keep_alive_secs: u64,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_keep_alive() -> u64 {
    DEFAULT_SCROLL_KEEP_ALIVE_SECS
}

impl RepositoryConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            tls: false,
            range_indexes: BTreeMap::new(),
            fulltext_disabled: false,
            trash_mode: TrashMode::default(),
            page_size: DEFAULT_PAGE_SIZE,
            scroll_keep_alive_secs: DEFAULT_SCROLL_KEEP_ALIVE_SECS,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Declare a range index on a field
    pub fn with_range_index(mut self, field: impl Into<String>, wire_type: WireType) -> Self {
        self.range_indexes.insert(field.into(), wire_type);
        self
    }

    pub fn with_fulltext_disabled(mut self, disabled: bool) -> Self {
        self.fulltext_disabled = disabled;
        self
    }

    pub fn with_trash_mode(mut self, mode: TrashMode) -> Self {
        self.trash_mode = mode;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_scroll_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.scroll_keep_alive_secs = keep_alive.as_secs();
        self
    }

    pub fn scroll_keep_alive(&self) -> Duration {
        Duration::from_secs(self.scroll_keep_alive_secs)
    }

    /// Compiler options derived from this configuration
    pub fn compiler_config(&self) -> CompilerConfig {
        self.range_indexes.iter().fold(
            CompilerConfig::new()
                .with_fulltext_disabled(self.fulltext_disabled)
                .with_trash_mode(self.trash_mode),
            |config, (field, wire_type)| config.with_range_index(field.clone(), *wire_type),
        )
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - TREEDOC_ENDPOINT (required)
    /// - TREEDOC_USERNAME (required)
    /// - TREEDOC_PASSWORD (required)
    /// - TREEDOC_TLS (optional, default: "false")
    /// - TREEDOC_RANGE_INDEXES (optional) - `field:type,...`, e.g. `dc:modified:dateTime`
    /// - TREEDOC_FULLTEXT_DISABLED (optional, default: "false")
    /// - TREEDOC_TRASH_MODE (optional) - `lifecycle`, `property` or `migration`
    /// - TREEDOC_PAGE_SIZE (optional, default: 100)
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint = std::env::var("TREEDOC_ENDPOINT").map_err(|_| "TREEDOC_ENDPOINT not set")?;
        let username = std::env::var("TREEDOC_USERNAME").map_err(|_| "TREEDOC_USERNAME not set")?;
        let password = std::env::var("TREEDOC_PASSWORD").map_err(|_| "TREEDOC_PASSWORD not set")?;
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false)
        };

        let mut config = Self::new(endpoint, username, password)
            .with_tls(flag("TREEDOC_TLS"))
            .with_fulltext_disabled(flag("TREEDOC_FULLTEXT_DISABLED"));
        if let Ok(raw) = std::env::var("TREEDOC_RANGE_INDEXES") {
            config.range_indexes = parse_range_indexes(&raw)?;
        }
        if let Ok(mode) = std::env::var("TREEDOC_TRASH_MODE") {
            config.trash_mode = mode.parse()?;
        }
        if let Ok(size) = std::env::var("TREEDOC_PAGE_SIZE") {
            let size = size
                .parse::<usize>()
                .map_err(|e| format!("TREEDOC_PAGE_SIZE: {e}"))?;
            config = config.with_page_size(size);
        }
        Ok(config)
    }

    /// Check the endpoint against the TLS requirement
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.endpoint.is_empty() {
            return Err("endpoint is empty".to_string());
        }
        if self.tls && !self.endpoint.starts_with("https://") {
            return Err(format!("TLS required but endpoint is {}", self.endpoint));
        }
        Ok(())
    }
}

/// Parse `field:type,...`; the type is after the last `:` since field keys
/// carry a prefix.
pub fn parse_range_indexes(raw: &str) -> std::result::Result<BTreeMap<String, WireType>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (field, wire_type) = entry
                .rsplit_once(':')
                .ok_or_else(|| format!("range index {entry} lacks a type"))?;
            Ok((field.to_string(), wire_type.parse::<WireType>()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_indexes() {
        let indexes = parse_range_indexes("dc:modified:dateTime, size:long").unwrap();
        assert_eq!(indexes.get("dc:modified"), Some(&WireType::Calendar));
        assert_eq!(indexes.get("size"), Some(&WireType::Long));
        assert!(parse_range_indexes("size").is_err());
        assert!(parse_range_indexes("size:blob").is_err());
    }

    #[test]
    fn test_compiler_config() {
        let config = RepositoryConfig::new("http://localhost:8000", "admin", "admin")
            .with_range_index("size", WireType::Long)
            .with_trash_mode(TrashMode::Property);
        let compiler = config.compiler_config();
        assert_eq!(compiler.range_indexes.get("size"), Some(&WireType::Long));
        assert_eq!(compiler.trash_mode, TrashMode::Property);
    }

    #[test]
    fn test_tls_validation() {
        let config = RepositoryConfig::new("http://localhost:8000", "a", "b").with_tls(true);
        assert!(config.validate().is_err());
        assert!(config.with_tls(false).validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RepositoryConfig = serde_json::from_str(
            r#"{"endpoint":"https://db","username":"u","password":"p",
                "range_indexes":{"size":"long"}}"#,
        )
        .unwrap();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.trash_mode, TrashMode::LifeCycle);
        assert_eq!(config.range_indexes.get("size"), Some(&WireType::Long));
    }
}
