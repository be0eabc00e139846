//! Component repository: which components may connect, and how.
//!
//! Each [`CompRepoItem`] describes one external component: its domain, the
//! shared secret, and for outbound links the port and remote host to dial.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::session::ConnectionDirection;
use crate::ExtCompError;

/// Repository entry for one external component.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompRepoItem {
    /// Component domain
    pub domain: String,
    /// Port to dial or listen on; 0 means the component connects to our
    /// shared listener.
    #[serde(default)]
    pub port: u16,
    /// Host to dial; defaults to the domain
    #[serde(default)]
    pub remote_host: Option<String>,
    /// Connection direction
    #[serde(default)]
    pub direction: ConnectionDirection,
    /// Shared secret for the handshake / SASL PLAIN
    pub secret: String,
    /// Stream namespace; `None` lets the protocol auto-detect
    #[serde(default)]
    pub xmlns: Option<String>,
}

impl fmt::Debug for CompRepoItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompRepoItem")
            .field("domain", &self.domain)
            .field("port", &self.port)
            .field("remote_host", &self.remote_host)
            .field("direction", &self.direction)
            .field("secret", &"[REDACTED]")
            .field("xmlns", &self.xmlns)
            .finish()
    }
}

impl CompRepoItem {
    /// Create an item for a component that connects to our shared listener.
    pub fn new(domain: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            port: 0,
            remote_host: None,
            direction: ConnectionDirection::Accept,
            secret: secret.into(),
            xmlns: None,
        }
    }

    /// Builder-style port and direction.
    pub fn with_port(mut self, port: u16, direction: ConnectionDirection) -> Self {
        self.port = port;
        self.direction = direction;
        self
    }

    /// Builder-style remote host.
    pub fn with_remote_host(mut self, host: impl Into<String>) -> Self {
        self.remote_host = Some(host.into());
        self
    }

    /// Builder-style stream namespace.
    pub fn with_xmlns(mut self, xmlns: impl Into<String>) -> Self {
        self.xmlns = Some(xmlns.into());
        self
    }

    /// Host to dial for outbound connections.
    pub fn remote_host(&self) -> &str {
        self.remote_host.as_deref().unwrap_or(&self.domain)
    }

    /// True when this item needs its own port (listener or outbound dial).
    pub fn has_port(&self) -> bool {
        self.port > 0
    }
}

/// Read-only lookup of component configuration.
pub trait ComponentRepository: Send + Sync {
    /// Look up an item by domain (case-insensitive).
    fn item(&self, domain: &str) -> Option<CompRepoItem>;

    /// All configured items.
    fn items(&self) -> Vec<CompRepoItem>;
}

/// Repository held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    items: DashMap<String, CompRepoItem>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a repository from a list of items. Later items replace earlier
    /// ones with the same domain.
    pub fn from_items(items: impl IntoIterator<Item = CompRepoItem>) -> Self {
        let repo = Self::new();
        for item in items {
            repo.add(item);
        }
        repo
    }

    /// Add or replace an item.
    pub fn add(&self, item: CompRepoItem) {
        debug!(domain = %item.domain, "Component repository item added");
        self.items.insert(item.domain.to_lowercase(), item);
    }

    /// Remove an item by domain.
    pub fn remove(&self, domain: &str) -> Option<CompRepoItem> {
        self.items.remove(&domain.to_lowercase()).map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl ComponentRepository for InMemoryRepository {
    fn item(&self, domain: &str) -> Option<CompRepoItem> {
        self.items.get(&domain.to_lowercase()).map(|e| e.value().clone())
    }

    fn items(&self) -> Vec<CompRepoItem> {
        let mut items: Vec<_> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.domain.cmp(&b.domain));
        items
    }
}

#[derive(Debug, Default, Deserialize)]
struct RepositoryFile {
    #[serde(default)]
    components: Vec<CompRepoItem>,
}

/// Repository loaded once from a TOML file of `[[components]]` tables.
#[derive(Debug)]
pub struct FileRepository {
    path: PathBuf,
    inner: InMemoryRepository,
}

impl FileRepository {
    /// Load the repository file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExtCompError> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ExtCompError::repository(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let file: RepositoryFile = toml::from_str(&content).map_err(|e| {
            ExtCompError::repository(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        info!(
            path = %path.display(),
            components = file.components.len(),
            "Loaded component repository"
        );

        Ok(Self {
            path,
            inner: InMemoryRepository::from_items(file.components),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ComponentRepository for FileRepository {
    fn item(&self, domain: &str) -> Option<CompRepoItem> {
        self.inner.item(domain)
    }

    fn items(&self) -> Vec<CompRepoItem> {
        self.inner.items()
    }
}

/// Repository selection from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository kind: `memory` or `file`
    pub kind: String,
    /// Path of the TOML file for the `file` kind
    pub path: Option<PathBuf>,
    /// Inline items for the `memory` kind
    pub components: Vec<CompRepoItem>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            path: None,
            components: Vec::new(),
        }
    }
}

/// Instantiate the repository named by the configuration.
pub fn create_repository(
    config: &RepositoryConfig,
) -> Result<Arc<dyn ComponentRepository>, ExtCompError> {
    match config.kind.as_str() {
        "memory" => Ok(Arc::new(InMemoryRepository::from_items(
            config.components.iter().cloned(),
        ))),
        "file" => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| ExtCompError::config("File repository requires a path"))?;
            Ok(Arc::new(FileRepository::load(path)?))
        }
        other => Err(ExtCompError::config(format!(
            "Unknown repository kind: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_debug_redacts_secret() {
        let item = CompRepoItem::new("muc.example.com", "hunter2");
        let debug = format!("{:?}", item);
        assert!(debug.contains("muc.example.com"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_in_memory_lookup_is_case_insensitive() {
        let repo = InMemoryRepository::from_items([CompRepoItem::new("MUC.example.com", "s")]);
        assert!(repo.item("muc.EXAMPLE.com").is_some());
        assert!(repo.item("other.example.com").is_none());
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_remote_host_defaults_to_domain() {
        let item = CompRepoItem::new("muc.example.com", "s");
        assert_eq!(item.remote_host(), "muc.example.com");

        let item = item.with_remote_host("10.0.0.5");
        assert_eq!(item.remote_host(), "10.0.0.5");
    }

    #[test]
    fn test_file_repository_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[components]]
domain = "muc.example.com"
secret = "s1"

[[components]]
domain = "pubsub.example.com"
secret = "s2"
port = 5270
direction = "connect"
remote_host = "pubsub.internal"
"#
        )
        .unwrap();

        let repo = FileRepository::load(file.path()).unwrap();
        let items = repo.items();
        assert_eq!(items.len(), 2);

        let pubsub = repo.item("pubsub.example.com").unwrap();
        assert_eq!(pubsub.port, 5270);
        assert_eq!(pubsub.direction, ConnectionDirection::Connect);
        assert_eq!(pubsub.remote_host(), "pubsub.internal");

        let muc = repo.item("muc.example.com").unwrap();
        assert!(!muc.has_port());
        assert_eq!(muc.direction, ConnectionDirection::Accept);
    }

    #[test]
    fn test_create_repository_unknown_kind() {
        let config = RepositoryConfig {
            kind: "ldap".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_repository(&config),
            Err(ExtCompError::Config(_))
        ));
    }

    #[test]
    fn test_create_repository_file_without_path() {
        let config = RepositoryConfig {
            kind: "file".to_string(),
            ..Default::default()
        };
        assert!(create_repository(&config).is_err());
    }
}
