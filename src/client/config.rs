use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use async_lsp::lsp_types::Url;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    transport::{
        InitialConnectPolicy, ServerAddress, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RECONNECT_DELAY_MS,
    },
};

pub const DEFAULT_OUTPUT_CHANNEL: &str = "[rpmspec_lsp] RPMSpecFileLanguageServer";

pub const RPMSPEC_LANGUAGE_ID: &str = "rpmspec";

/// One entry of a document selector. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl DocumentFilter {
    pub fn matches(&self, uri: &Url, language_id: &str) -> bool {
        self.scheme.as_deref().map_or(true, |s| s == uri.scheme())
            && self.language.as_deref().map_or(true, |l| l == language_id)
    }
}

/// Documents served by the client. An empty selector serves nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentSelector(pub Vec<DocumentFilter>);

impl DocumentSelector {
    pub fn matches(&self, uri: &Url, language_id: &str) -> bool {
        self.0.iter().any(|f| f.matches(uri, language_id))
    }
}

impl Default for DocumentSelector {
    fn default() -> Self {
        Self(vec![DocumentFilter {
            scheme: Some("file".to_string()),
            language: Some(RPMSPEC_LANGUAGE_ID.to_string()),
        }])
    }
}

/// Client configuration, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_delay_ms: u64,
    pub initial_connect: InitialConnectPolicy,
    /// Display label. Derived from the port when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub output_channel: String,
    pub document_selector: DocumentSelector,
    /// Workspace folder announced during initialization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            initial_connect: InitialConnectPolicy::default(),
            name: None,
            output_channel: DEFAULT_OUTPUT_CHANNEL.to_string(),
            document_selector: DocumentSelector::default(),
            root: None,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    #[must_use]
    pub fn address(&self) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port)
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("tcp lang server (port {})", self.port))
    }

    /// Workspace folder URI, if a root directory is configured and absolute.
    #[must_use]
    pub fn root_uri(&self) -> Option<Url> {
        let root = self.root.as_deref()?;
        match Url::from_directory_path(root) {
            Ok(uri) => Some(uri),
            Err(()) => {
                tracing::warn!("ignoring non-absolute workspace root {}", root.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_default_selector_serves_local_spec_files() {
        let selector = DocumentSelector::default();
        assert!(selector.matches(&url("file:///src/foo.spec"), "rpmspec"));
        assert!(!selector.matches(&url("file:///src/foo.py"), "python"));
        assert!(!selector.matches(&url("untitled:Untitled-1"), "rpmspec"));
    }

    #[test]
    fn test_filter_without_fields_matches_anything() {
        let filter = DocumentFilter::default();
        assert!(filter.matches(&url("untitled:x"), "whatever"));
        assert!(!DocumentSelector(Vec::new()).matches(&url("file:///a"), "rpmspec"));
    }

    #[test]
    fn test_defaults_follow_reference_client() {
        let config = ClientConfig::default();
        assert_eq!(config.address().to_string(), "127.0.0.1:2087");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(), crate::transport::DEFAULT_RECONNECT_DELAY);
        assert_eq!(config.display_name(), "tcp lang server (port 2087)");
        assert_eq!(config.output_channel, DEFAULT_OUTPUT_CHANNEL);
        assert_eq!(config.initial_connect, InitialConnectPolicy::Retry);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"port": 9999, "initial_connect": "fail_fast",
                "document_selector": [{"language": "rpmspec"}]}"#,
        )
        .unwrap();

        assert_eq!(config.port, 9999);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.initial_connect, InitialConnectPolicy::FailFast);
        assert!(config
            .document_selector
            .matches(&url("untitled:Untitled-1"), "rpmspec"));
        assert_eq!(config.display_name(), "tcp lang server (port 9999)");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<ClientConfig>(r#"{"prot": 1}"#).is_err());
    }
}
