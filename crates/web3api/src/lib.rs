//! Web3API client.
//!
//! Resolve an API by ENS domain or IPFS content address, fetch its package
//! through pluggable portals, and run GraphQL-style queries against it.
//!
//! ```no_run
//! use web3api::{PortalSet, StaticNamingPortal, GatewayStoragePortal, Web3Api, Web3ApiConfig};
//!
//! # async fn run() -> web3api::Web3ApiResult<()> {
//! let portals = PortalSet::new()
//!     .with_naming(StaticNamingPortal::new().with("example.eth", "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG"))
//!     .with_storage(GatewayStoragePortal::new("https://ipfs.io"));
//! let client = Web3Api::new(Web3ApiConfig::new("example.eth").portals(portals))?;
//! let plan = client.plan(&"{ balance(address: \"0xabc\") }".parse()?, None).await?;
//! println!("{:?}", plan.order());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod identifier;
pub mod module;
pub mod package;
pub mod portals;
pub mod query;
pub mod schema;

pub use client::Web3Api;
pub use config::{ExecutorConfig, Web3ApiConfig};
pub use error::{
    ParseError, PlanError, PortalError, VariableIssue, VariableMismatch, Web3ApiError, Web3ApiResult,
};
pub use events::{EventBus, QueryEvent};
pub use identifier::{ContentAddress, Endpoint, IdentifierKind};
pub use module::{FnInvoker, InvocationError, ModuleInvoker, NoopInvoker};
pub use package::{ApiPackage, ModuleRef, PackageLoader};
pub use portals::{
    FsStoragePortal, GatewayStoragePortal, MemoryStoragePortal, NamingPortal, Portal, PortalName,
    PortalSet, StaticNamingPortal, StoragePortal,
};
pub use query::{ExecutionPlan, ExecutionResult, FieldOutcome, QueryDocument, Variables};
pub use schema::{ApiSchema, TypeRef};
