//! API packages and the loader that fetches them from storage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Web3ApiError, Web3ApiResult};
use crate::identifier::ContentAddress;
use crate::portals::StoragePortal;
use crate::schema::{ApiSchema, FieldDef};

/// A compiled module shipped inside a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Path of the compiled artifact relative to the package root.
    pub path: String,
}

/// Everything a module runtime needs to locate and call one function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRef {
    /// Address of the package the module belongs to.
    pub package: ContentAddress,
    /// Module name inside the package.
    pub module: String,
    /// Artifact path inside the package.
    pub path: String,
    /// Function to call.
    pub entry: String,
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.package, self.module, self.entry)
    }
}

/// A decoded, validated API package. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiPackage {
    #[serde(skip)]
    address: ContentAddress,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleSpec>,
    pub schema: ApiSchema,
}

impl ApiPackage {
    /// Decode a JSON manifest fetched from `address`.
    pub fn decode(address: &ContentAddress, bytes: &[u8]) -> Web3ApiResult<Self> {
        let decode_err = |reason: String| Web3ApiError::PackageDecode {
            address: address.to_string(),
            reason,
        };

        let mut package: ApiPackage =
            serde_json::from_slice(bytes).map_err(|e| decode_err(e.to_string()))?;
        package
            .schema
            .validate(|m| package.modules.contains_key(m))
            .map_err(decode_err)?;
        package.address = address.clone();
        Ok(package)
    }

    /// Content address this package was loaded from.
    pub fn address(&self) -> &ContentAddress {
        &self.address
    }

    /// Module reference for a field binding, if the field is bound.
    pub fn module_ref(&self, field_name: &str, field: &FieldDef) -> Option<ModuleRef> {
        let module = field.module.as_ref()?;
        let spec = self.modules.get(module)?;
        Some(ModuleRef {
            package: self.address.clone(),
            module: module.clone(),
            path: spec.path.clone(),
            entry: field
                .entry
                .clone()
                .unwrap_or_else(|| field_name.to_string()),
        })
    }
}

/// Fetches packages through a storage portal. No retries here; those
/// belong to the portal.
pub struct PackageLoader<'a> {
    storage: &'a dyn StoragePortal,
}

impl<'a> PackageLoader<'a> {
    pub fn new(storage: &'a dyn StoragePortal) -> Self {
        Self { storage }
    }

    pub async fn load(&self, address: &ContentAddress) -> Web3ApiResult<ApiPackage> {
        tracing::debug!("Fetching package {address}");
        let bytes = self
            .storage
            .fetch(address)
            .await
            .map_err(|source| Web3ApiError::PackageFetch {
                target: address.to_string(),
                source,
            })?;
        let package = ApiPackage::decode(address, &bytes)?;
        tracing::info!(
            "Loaded package {} ({} query fields, {} modules) from {address}",
            package.name,
            package.schema.query.len(),
            package.modules.len()
        );
        Ok(package)
    }
}
