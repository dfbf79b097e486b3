//! Local portals: in-memory tables and a directory-backed store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{NamingPortal, StoragePortal};
use crate::error::PortalError;
use crate::identifier::ContentAddress;

/// Naming portal backed by a fixed domain → address table.
#[derive(Debug, Clone, Default)]
pub struct StaticNamingPortal {
    records: HashMap<String, ContentAddress>,
}

impl StaticNamingPortal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. Domains are matched case-insensitively.
    pub fn with(mut self, domain: &str, address: &str) -> Self {
        self.insert(domain, address);
        self
    }

    pub fn insert(&mut self, domain: &str, address: &str) {
        self.records
            .insert(domain.to_ascii_lowercase(), ContentAddress::new(address));
    }

    /// Load records from a JSON object of `{ "domain": "address" }`.
    pub fn from_json(json: &str) -> Result<Self, PortalError> {
        let table: HashMap<String, String> = serde_json::from_str(json)
            .map_err(|e| PortalError::Decode(format!("invalid naming table: {e}")))?;
        let mut portal = Self::new();
        for (domain, address) in &table {
            portal.insert(domain, address);
        }
        Ok(portal)
    }

    pub fn from_file(path: &Path) -> Result<Self, PortalError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl NamingPortal for StaticNamingPortal {
    async fn resolve_domain(&self, domain: &str) -> Result<ContentAddress, PortalError> {
        self.records
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| PortalError::NotFound(format!("no record for {domain}")))
    }
}

/// Storage portal backed by an in-memory table. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoragePortal {
    objects: Arc<DashMap<ContentAddress, Vec<u8>>>,
}

impl MemoryStoragePortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, address: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(address, bytes);
        self
    }

    pub fn insert(&self, address: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .insert(ContentAddress::new(address), bytes.into());
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl StoragePortal for MemoryStoragePortal {
    async fn fetch(&self, address: &ContentAddress) -> Result<Vec<u8>, PortalError> {
        self.objects
            .get(address)
            .map(|b| b.value().clone())
            .ok_or_else(|| PortalError::NotFound(address.to_string()))
    }
}

/// Storage portal reading `<root>/<address>` or `<root>/<address>.json`.
#[derive(Debug, Clone)]
pub struct FsStoragePortal {
    root: PathBuf,
}

impl FsStoragePortal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, address: &ContentAddress) -> [PathBuf; 2] {
        [
            self.root.join(address.as_str()),
            self.root.join(format!("{address}.json")),
        ]
    }
}

#[async_trait]
impl StoragePortal for FsStoragePortal {
    async fn fetch(&self, address: &ContentAddress) -> Result<Vec<u8>, PortalError> {
        // Addresses become file names; refuse anything that could walk out of root.
        if address.as_str().contains(&['/', '\\'][..]) || address.as_str().starts_with('.') {
            return Err(PortalError::NotFound(address.to_string()));
        }
        for path in self.candidates(address) {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    tracing::debug!("Read {} bytes from {}", bytes.len(), path.display());
                    return Ok(bytes);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(PortalError::Io(e)),
            }
        }
        Err(PortalError::NotFound(format!(
            "{address} not found under {}",
            self.root.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_naming_is_case_insensitive() {
        let naming = StaticNamingPortal::new().with("Example.eth", "Qm123");
        let addr = naming.resolve_domain("EXAMPLE.ETH").await.unwrap();
        assert_eq!(addr.as_str(), "Qm123");
        assert!(naming.resolve_domain("other.eth").await.is_err());
    }

    #[test]
    fn test_static_naming_from_json() {
        let naming = StaticNamingPortal::from_json(r#"{"a.eth": "QmA", "b.eth": "QmB"}"#).unwrap();
        assert_eq!(naming.len(), 2);
        assert!(matches!(
            StaticNamingPortal::from_json("[1, 2]"),
            Err(PortalError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_storage_clones_share_table() {
        let store = MemoryStoragePortal::new();
        let handle = store.clone();
        handle.insert("QmA", b"hello".to_vec());
        let bytes = store.fetch(&ContentAddress::new("QmA")).await.unwrap();
        assert_eq!(bytes, b"hello");
        assert!(matches!(
            store.fetch(&ContentAddress::new("QmB")).await,
            Err(PortalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_storage_reads_plain_and_json_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("QmPlain"), b"plain").unwrap();
        std::fs::write(dir.path().join("QmJson.json"), b"{}").unwrap();

        let store = FsStoragePortal::new(dir.path());
        assert_eq!(
            store.fetch(&ContentAddress::new("QmPlain")).await.unwrap(),
            b"plain"
        );
        assert_eq!(
            store.fetch(&ContentAddress::new("QmJson")).await.unwrap(),
            b"{}"
        );
        assert!(matches!(
            store.fetch(&ContentAddress::new("QmMissing")).await,
            Err(PortalError::NotFound(_))
        ));
        assert!(store
            .fetch(&ContentAddress::new("../etc/passwd"))
            .await
            .is_err());
    }
}
