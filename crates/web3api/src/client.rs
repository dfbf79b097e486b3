//! Client facade: the one object callers hold.
//!
//! A query reads the endpoint and portals once when it starts and never
//! writes shared state afterwards. Dropping a query future at any await
//! point leaves the client exactly as it was.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::{ExecutorConfig, Web3ApiConfig};
use crate::error::{Web3ApiError, Web3ApiResult};
use crate::events::{EventBus, QueryEvent};
use crate::identifier::{self, ContentAddress, Endpoint};
use crate::module::ModuleInvoker;
use crate::package::{ApiPackage, PackageLoader};
use crate::portals::{NamingPortal, Portal, PortalName, PortalSet, StoragePortal};
use crate::query::executor::{ExecutionResult, PlanExecutor};
use crate::query::parser::{self, QueryDocument};
use crate::query::planner::{self, ExecutionPlan, Variables};

/// A Web3API client bound to one endpoint.
pub struct Web3Api {
    endpoint: RwLock<Endpoint>,
    portals: PortalSet,
    invoker: Arc<dyn ModuleInvoker>,
    executor: ExecutorConfig,
    events: EventBus,
}

/// Endpoint and portals as seen by one query.
struct Snapshot {
    endpoint: Endpoint,
    naming: Option<Arc<dyn NamingPortal>>,
    storage: Option<Arc<dyn StoragePortal>>,
}

impl Web3Api {
    /// Build a client. Fails with `InvalidIdentifier` if `config.uri` is
    /// neither an ENS domain nor an IPFS content address.
    pub fn new(config: Web3ApiConfig) -> Web3ApiResult<Self> {
        let endpoint = Endpoint::parse(&config.uri)?;
        tracing::info!(
            "Web3API client for {endpoint} ({:?}), portals: {:?}",
            endpoint.kind(),
            config.portals.installed()
        );
        Ok(Self {
            endpoint: RwLock::new(endpoint),
            portals: config.portals,
            invoker: config.invoker,
            executor: config.executor,
            events: EventBus::new(config.event_capacity),
        })
    }

    /// Validate `uri` and make it the endpoint for subsequent queries.
    /// On failure nothing changes and no portal is contacted.
    pub fn set_endpoint(&self, uri: &str) -> Web3ApiResult<()> {
        let endpoint = Endpoint::parse(uri)?;
        tracing::debug!("Endpoint set to {endpoint}");
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = endpoint;
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Portal installed under `name` (`ipfs`, `ens`, `storage`, `naming`, ...).
    pub fn get_portal(&self, name: &str) -> Web3ApiResult<Option<Portal>> {
        Ok(self.portals.get(name.parse::<PortalName>()?))
    }

    /// Replace the portal under `name`. Queries already running keep the
    /// portal they started with.
    pub fn set_portal(&self, name: &str, portal: Portal) -> Web3ApiResult<()> {
        self.portals.set(name.parse::<PortalName>()?, portal)
    }

    pub fn portals(&self) -> &PortalSet {
        &self.portals
    }

    /// Receive lifecycle events for every query run on this client.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    /// Content address the current endpoint resolves to.
    pub async fn resolve(&self) -> Web3ApiResult<ContentAddress> {
        let snapshot = self.snapshot();
        Self::resolve_with(&snapshot).await
    }

    /// Fetch and decode the package behind the current endpoint.
    pub async fn package(&self) -> Web3ApiResult<ApiPackage> {
        let snapshot = self.snapshot();
        let address = Self::resolve_with(&snapshot).await?;
        Self::load_with(&snapshot, &address).await
    }

    /// Resolve, load and plan without executing.
    pub async fn plan(
        &self,
        doc: &QueryDocument,
        variables: Option<&Variables>,
    ) -> Web3ApiResult<ExecutionPlan> {
        let query_id = Uuid::new_v4();
        let started = Instant::now();
        let (_, plan) = self.prepare(query_id, doc, variables).await?;
        self.events.emit(QueryEvent::QueryPlanned {
            query_id,
            steps: plan.steps.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(plan)
    }

    /// Run a parsed query.
    ///
    /// Errors returned here happened before any module was invoked. Failures
    /// during execution are reported per field inside the result.
    pub async fn query(
        &self,
        doc: &QueryDocument,
        variables: Option<&Variables>,
    ) -> Web3ApiResult<ExecutionResult> {
        let query_id = Uuid::new_v4();
        let (package, plan) = self.prepare(query_id, doc, variables).await?;

        let executor = PlanExecutor::new(Arc::clone(&self.invoker), self.executor.clone())
            .with_events(self.events.clone(), query_id);
        Ok(executor.execute(&plan, &package.schema).await)
    }

    /// Parse `source` and run it.
    pub async fn query_str(
        &self,
        source: &str,
        variables: Option<&Variables>,
    ) -> Web3ApiResult<ExecutionResult> {
        let doc = parser::parse(source)?;
        self.query(&doc, variables).await
    }

    async fn prepare(
        &self,
        query_id: Uuid,
        doc: &QueryDocument,
        variables: Option<&Variables>,
    ) -> Web3ApiResult<(ApiPackage, ExecutionPlan)> {
        let snapshot = self.snapshot();
        let started = Instant::now();
        tracing::info!("Query {query_id} started against {}", snapshot.endpoint);
        self.events.emit(QueryEvent::QueryStarted {
            query_id,
            endpoint: snapshot.endpoint.to_string(),
        });

        let result = self.prepare_with(query_id, &snapshot, doc, variables).await;
        if let Err(e) = &result {
            tracing::warn!(
                "Query {query_id} aborted after {}ms: {e}",
                started.elapsed().as_millis()
            );
            self.events.emit(QueryEvent::QueryFailed {
                query_id,
                kind: e.kind().to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn prepare_with(
        &self,
        query_id: Uuid,
        snapshot: &Snapshot,
        doc: &QueryDocument,
        variables: Option<&Variables>,
    ) -> Web3ApiResult<(ApiPackage, ExecutionPlan)> {
        let address = Self::resolve_with(snapshot).await?;
        self.events.emit(QueryEvent::EndpointResolved {
            query_id,
            endpoint: snapshot.endpoint.to_string(),
            address: address.to_string(),
        });

        let package = Self::load_with(snapshot, &address).await?;
        self.events.emit(QueryEvent::PackageLoaded {
            query_id,
            address: address.to_string(),
            name: package.name.clone(),
        });

        let empty = Variables::new();
        let plan = planner::plan(doc, variables.unwrap_or(&empty), &package)?;
        tracing::debug!("Query {query_id} plan: {:?}", plan.order());
        self.events.emit(QueryEvent::PlanBuilt {
            query_id,
            steps: plan.steps.len(),
            order: plan.order().into_iter().map(String::from).collect(),
        });

        Ok((package, plan))
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            endpoint: self.endpoint(),
            naming: self.portals.naming().ok(),
            storage: self.portals.storage().ok(),
        }
    }

    async fn resolve_with(snapshot: &Snapshot) -> Web3ApiResult<ContentAddress> {
        match (&snapshot.endpoint, &snapshot.naming) {
            (Endpoint::NamingDomain(_), None) => Err(Web3ApiError::MissingPortal(PortalName::Naming)),
            (endpoint, Some(naming)) => identifier::resolve(endpoint, naming.as_ref()).await,
            (Endpoint::ContentAddress(addr), None) => Ok(addr.clone()),
        }
    }

    async fn load_with(snapshot: &Snapshot, address: &ContentAddress) -> Web3ApiResult<ApiPackage> {
        let storage = snapshot
            .storage
            .as_ref()
            .ok_or(Web3ApiError::MissingPortal(PortalName::Storage))?;
        PackageLoader::new(storage.as_ref()).load(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portals::{MemoryStoragePortal, StaticNamingPortal};

    const CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    #[test]
    fn test_new_rejects_invalid_uri() {
        let err = Web3Api::new(Web3ApiConfig::new("http://example.com")).err().unwrap();
        assert_eq!(err.kind(), "invalid_identifier");
    }

    #[test]
    fn test_set_endpoint_is_validated() {
        let client = Web3Api::new(Web3ApiConfig::new("example.eth")).unwrap();
        assert!(client.set_endpoint("garbage").is_err());
        assert_eq!(client.endpoint(), Endpoint::NamingDomain("example.eth".into()));

        client.set_endpoint(CID).unwrap();
        assert_eq!(client.endpoint().as_str(), CID);
    }

    #[test]
    fn test_portal_access_by_name() {
        let client = Web3Api::new(
            Web3ApiConfig::new(CID).portals(PortalSet::new().with_storage(MemoryStoragePortal::new())),
        )
        .unwrap();
        assert!(client.get_portal("ipfs").unwrap().is_some());
        assert!(client.get_portal("ens").unwrap().is_none());
        assert!(client.get_portal("ftp").is_err());

        let naming = Portal::Naming(Arc::new(StaticNamingPortal::new()));
        client.set_portal("ethereum", naming.clone()).unwrap();
        assert!(client.get_portal("naming").unwrap().unwrap().ptr_eq(&naming));
    }

    #[tokio::test]
    async fn test_missing_portals_abort_before_execution() {
        let client = Web3Api::new(Web3ApiConfig::new("example.eth")).unwrap();
        let err = client.resolve().await.unwrap_err();
        assert!(matches!(err, Web3ApiError::MissingPortal(PortalName::Naming)));

        client.set_endpoint(CID).unwrap();
        assert_eq!(client.resolve().await.unwrap().as_str(), CID);
        let err = client.package().await.unwrap_err();
        assert!(matches!(err, Web3ApiError::MissingPortal(PortalName::Storage)));
    }
}
