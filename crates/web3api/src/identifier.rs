//! Endpoint identifiers: IPFS content addresses and ENS domains.
//!
//! The two syntactic forms are mutually exclusive (a CID never contains a
//! dot, an ENS domain always does), so classification is a pure function of
//! the string and happens before anything touches the network.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Web3ApiError, Web3ApiResult};
use crate::portals::NamingPortal;

const SCHEME: &str = "w3://";

/// An immutable-content storage key (IPFS CID / multihash).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Wrap an address without validating it.
    ///
    /// Addresses handed back by a naming portal go through here: the portal
    /// is the authority on what it resolves to.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which of the two identifier forms a string is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    ContentAddress,
    NamingDomain,
}

/// A validated API endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Endpoint {
    ContentAddress(ContentAddress),
    NamingDomain(String),
}

impl Endpoint {
    /// Sanitize and classify an identifier string.
    pub fn parse(uri: &str) -> Web3ApiResult<Self> {
        let invalid = || Web3ApiError::InvalidIdentifier(uri.to_string());

        let trimmed = uri.trim();
        let body = trimmed.strip_prefix(SCHEME).unwrap_or(trimmed);
        let body = body.strip_prefix('/').unwrap_or(body);

        // An explicit authority prefix pins the form.
        let (forced, body) = if let Some(rest) = body.strip_prefix("ipfs/") {
            (Some(IdentifierKind::ContentAddress), rest)
        } else if let Some(rest) = body.strip_prefix("ens/") {
            (Some(IdentifierKind::NamingDomain), rest)
        } else {
            (None, body)
        };

        let kind = classify(body).ok_or_else(invalid)?;
        if forced.is_some_and(|f| f != kind) {
            return Err(invalid());
        }

        Ok(match kind {
            IdentifierKind::ContentAddress => {
                Endpoint::ContentAddress(ContentAddress::new(body))
            }
            IdentifierKind::NamingDomain => Endpoint::NamingDomain(body.to_ascii_lowercase()),
        })
    }

    pub fn kind(&self) -> IdentifierKind {
        match self {
            Endpoint::ContentAddress(_) => IdentifierKind::ContentAddress,
            Endpoint::NamingDomain(_) => IdentifierKind::NamingDomain,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Endpoint::ContentAddress(addr) => addr.as_str(),
            Endpoint::NamingDomain(domain) => domain,
        }
    }
}

impl FromStr for Endpoint {
    type Err = Web3ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn cid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CIDv0 (base58btc sha2-256 multihash) or CIDv1 in base32 multibase.
    RE.get_or_init(|| {
        Regex::new(r"^(Qm[1-9A-HJ-NP-Za-km-z]{44}|b[a-z2-7]{58,})$").expect("cid regex is valid")
    })
}

fn ens_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+eth$")
            .expect("ens regex is valid")
    })
}

/// True if `s` is an IPFS content address.
pub fn is_content_address(s: &str) -> bool {
    cid_regex().is_match(s)
}

/// True if `s` is an ENS domain.
pub fn is_naming_domain(s: &str) -> bool {
    ens_regex().is_match(s)
}

/// Classify a bare identifier (no scheme or prefix).
pub fn classify(s: &str) -> Option<IdentifierKind> {
    if is_content_address(s) {
        Some(IdentifierKind::ContentAddress)
    } else if is_naming_domain(s) {
        Some(IdentifierKind::NamingDomain)
    } else {
        None
    }
}

/// Turn an endpoint into the content address of its package.
///
/// Content addresses come back unchanged and the naming portal is not
/// touched. A naming-portal failure is reported as a package fetch failure
/// with the portal error as its cause.
pub async fn resolve(
    endpoint: &Endpoint,
    naming: &dyn NamingPortal,
) -> Web3ApiResult<ContentAddress> {
    match endpoint {
        Endpoint::ContentAddress(addr) => Ok(addr.clone()),
        Endpoint::NamingDomain(domain) => {
            tracing::debug!("Resolving ENS domain {domain}");
            let addr = naming
                .resolve_domain(domain)
                .await
                .map_err(|source| Web3ApiError::PackageFetch {
                    target: domain.clone(),
                    source,
                })?;
            tracing::debug!("{domain} resolved to {addr}");
            Ok(addr)
        }
    }
}
