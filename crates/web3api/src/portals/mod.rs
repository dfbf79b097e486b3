//! Portals: the client's external collaborators.
//!
//! A portal provides one capability: resolving a naming-service domain to a
//! content address, or fetching bytes by content address. The [`PortalSet`]
//! maps capability names to installed portals and is shared by every query
//! running on a client; swaps are last-writer-wins.

pub mod gateway;
pub mod memory;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PortalError, Web3ApiError, Web3ApiResult};
use crate::identifier::ContentAddress;

pub use gateway::GatewayStoragePortal;
pub use memory::{FsStoragePortal, MemoryStoragePortal, StaticNamingPortal};

/// Resolves naming-service domains (ENS) to content addresses.
#[async_trait]
pub trait NamingPortal: Send + Sync {
    async fn resolve_domain(&self, domain: &str) -> Result<ContentAddress, PortalError>;
}

/// Fetches immutable content by address (IPFS).
#[async_trait]
pub trait StoragePortal: Send + Sync {
    async fn fetch(&self, address: &ContentAddress) -> Result<Vec<u8>, PortalError>;
}

/// Capability names a portal can be installed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalName {
    Naming,
    Storage,
}

impl PortalName {
    pub const ALL: [PortalName; 2] = [PortalName::Naming, PortalName::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortalName::Naming => "naming",
            PortalName::Storage => "storage",
        }
    }
}

impl fmt::Display for PortalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortalName {
    type Err = Web3ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "naming" | "ens" | "ethereum" => Ok(PortalName::Naming),
            "storage" | "ipfs" => Ok(PortalName::Storage),
            _ => Err(Web3ApiError::UnknownPortal(s.to_string())),
        }
    }
}

/// An installed portal, tagged with its capability.
#[derive(Clone)]
pub enum Portal {
    Naming(Arc<dyn NamingPortal>),
    Storage(Arc<dyn StoragePortal>),
}

impl Portal {
    pub fn name(&self) -> PortalName {
        match self {
            Portal::Naming(_) => PortalName::Naming,
            Portal::Storage(_) => PortalName::Storage,
        }
    }

    /// True if both handles point at the same portal instance.
    pub fn ptr_eq(&self, other: &Portal) -> bool {
        match (self, other) {
            (Portal::Naming(a), Portal::Naming(b)) => Arc::ptr_eq(a, b),
            (Portal::Storage(a), Portal::Storage(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Portal::{}", self.name())
    }
}

/// Capability-name → portal mapping shared across concurrent queries.
#[derive(Default)]
pub struct PortalSet {
    portals: DashMap<PortalName, Portal>,
}

impl PortalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_naming(self, portal: impl NamingPortal + 'static) -> Self {
        self.portals
            .insert(PortalName::Naming, Portal::Naming(Arc::new(portal)));
        self
    }

    pub fn with_storage(self, portal: impl StoragePortal + 'static) -> Self {
        self.portals
            .insert(PortalName::Storage, Portal::Storage(Arc::new(portal)));
        self
    }

    /// Look up the portal installed under `name`.
    pub fn get(&self, name: PortalName) -> Option<Portal> {
        self.portals.get(&name).map(|p| p.value().clone())
    }

    /// Install `portal` under `name`, replacing whatever was there.
    pub fn set(&self, name: PortalName, portal: Portal) -> Web3ApiResult<()> {
        if portal.name() != name {
            return Err(Web3ApiError::PortalMismatch {
                name,
                found: portal.name(),
            });
        }
        tracing::debug!("Installing {name} portal");
        self.portals.insert(name, portal);
        Ok(())
    }

    pub fn naming(&self) -> Web3ApiResult<Arc<dyn NamingPortal>> {
        match self.get(PortalName::Naming) {
            Some(Portal::Naming(p)) => Ok(p),
            _ => Err(Web3ApiError::MissingPortal(PortalName::Naming)),
        }
    }

    pub fn storage(&self) -> Web3ApiResult<Arc<dyn StoragePortal>> {
        match self.get(PortalName::Storage) {
            Some(Portal::Storage(p)) => Ok(p),
            _ => Err(Web3ApiError::MissingPortal(PortalName::Storage)),
        }
    }

    /// Names of the installed portals.
    pub fn installed(&self) -> Vec<PortalName> {
        PortalName::ALL
            .into_iter()
            .filter(|n| self.portals.contains_key(n))
            .collect()
    }
}
