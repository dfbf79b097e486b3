//! End-to-end tests through the client facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_test::{assert_pending, task};

use web3api::error::PortalError;
use web3api::query::FieldOutcome;
use web3api::{
    ContentAddress, Endpoint, FnInvoker, MemoryStoragePortal, NamingPortal, Portal, PortalName,
    PortalSet, QueryEvent, StaticNamingPortal, StoragePortal, Variables, Web3Api, Web3ApiConfig,
    Web3ApiError,
};

fn manifest() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "name": "erc20",
        "modules": { "query": { "path": "query.wasm" } },
        "schema": {
            "query": {
                "balance": {
                    "type": "Int",
                    "args": [{ "name": "address", "type": "String!" }],
                    "module": "query"
                }
            }
        }
    }))
    .unwrap()
}

fn balance_invoker() -> FnInvoker {
    FnInvoker::new().with("balance", |args| {
        assert_eq!(args.get("address"), Some(&json!("0xabc")));
        Ok(json!(42))
    })
}

fn vars(v: Value) -> Variables {
    v.as_object().cloned().unwrap_or_default()
}

/// Counts calls and never resolves anything.
#[derive(Clone, Default)]
struct CountingPortal {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl NamingPortal for CountingPortal {
    async fn resolve_domain(&self, domain: &str) -> Result<ContentAddress, PortalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PortalError::NotFound(domain.to_string()))
    }
}

#[async_trait]
impl StoragePortal for CountingPortal {
    async fn fetch(&self, address: &ContentAddress) -> Result<Vec<u8>, PortalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PortalError::NotFound(address.to_string()))
    }
}

/// Storage that never completes a fetch.
struct StalledStorage;

#[async_trait]
impl StoragePortal for StalledStorage {
    async fn fetch(&self, _: &ContentAddress) -> Result<Vec<u8>, PortalError> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_end_to_end_balance_query() {
    let portals = PortalSet::new()
        .with_naming(StaticNamingPortal::new().with("example.eth", "Qm123"))
        .with_storage(MemoryStoragePortal::new().with("Qm123", manifest()));
    let client = Web3Api::new(
        Web3ApiConfig::new("example.eth")
            .portals(portals)
            .invoker(balance_invoker()),
    )
    .unwrap();

    let result = client
        .query_str(
            "{ balance(address: $addr) }",
            Some(&vars(json!({ "addr": "0xabc" }))),
        )
        .await
        .unwrap();

    assert!(result.is_ok());
    assert_json_eq!(result.to_response(), json!({ "data": { "balance": 42 } }));
}

#[tokio::test]
async fn test_query_events_in_order() {
    let portals = PortalSet::new()
        .with_naming(StaticNamingPortal::new().with("example.eth", "Qm123"))
        .with_storage(MemoryStoragePortal::new().with("Qm123", manifest()));
    let client = Web3Api::new(
        Web3ApiConfig::new("example.eth")
            .portals(portals)
            .invoker(balance_invoker()),
    )
    .unwrap();
    let mut rx = client.subscribe();

    let result = client
        .query_str("{ balance(address: \"0xabc\") }", None)
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.query_id(), result.query_id);
        let value = serde_json::to_value(&event).unwrap();
        kinds.push(value["type"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(
        kinds,
        vec![
            "QueryStarted",
            "EndpointResolved",
            "PackageLoaded",
            "PlanBuilt",
            "StepTransition",
            "StepTransition",
            "QueryFinished",
        ]
    );
}

#[tokio::test]
async fn test_dry_run_ends_with_terminal_event() {
    let portals = PortalSet::new()
        .with_naming(StaticNamingPortal::new().with("example.eth", "Qm123"))
        .with_storage(MemoryStoragePortal::new().with("Qm123", manifest()));
    let client = Web3Api::new(Web3ApiConfig::new("example.eth").portals(portals)).unwrap();
    let mut rx = client.subscribe();

    let doc = web3api::query::parse("{ balance(address: \"0xabc\") }").unwrap();
    let plan = client.plan(&doc, None).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(QueryEvent::QueryStarted { .. })));
    let last = events.last().unwrap();
    assert!(last.is_terminal());
    assert!(matches!(last, QueryEvent::QueryPlanned { steps, .. } if *steps == plan.steps.len()));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, QueryEvent::StepTransition { .. })));
}

#[tokio::test]
async fn test_content_address_skips_naming_portal() {
    let naming = CountingPortal::default();
    let cid = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
    let portals = PortalSet::new()
        .with_naming(naming.clone())
        .with_storage(MemoryStoragePortal::new().with(cid, manifest()));
    let client = Web3Api::new(
        Web3ApiConfig::new(cid)
            .portals(portals)
            .invoker(balance_invoker()),
    )
    .unwrap();

    let result = client
        .query_str("{ balance(address: \"0xabc\") }", None)
        .await
        .unwrap();
    assert_eq!(
        result.get("balance"),
        Some(&FieldOutcome::Succeeded { value: json!(42) })
    );
    assert_eq!(naming.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_endpoint_contacts_no_portal() {
    let counter = CountingPortal::default();
    let portals = PortalSet::new()
        .with_naming(counter.clone())
        .with_storage(counter.clone());
    let client = Web3Api::new(Web3ApiConfig::new("example.eth").portals(portals)).unwrap();

    for bad in ["", "example.com", "Qm123", "ipfs/example.eth", "w3://nope"] {
        let err = client.set_endpoint(bad).unwrap_err();
        assert!(matches!(err, Web3ApiError::InvalidIdentifier(_)), "{bad}");
    }
    assert_eq!(client.endpoint(), Endpoint::NamingDomain("example.eth".into()));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fetch_failure_aborts_query() {
    let portals = PortalSet::new()
        .with_naming(StaticNamingPortal::new().with("example.eth", "QmMissing"))
        .with_storage(MemoryStoragePortal::new());
    let client = Web3Api::new(Web3ApiConfig::new("example.eth").portals(portals)).unwrap();
    let mut rx = client.subscribe();

    let err = client
        .query_str("{ balance(address: \"0xabc\") }", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Web3ApiError::PackageFetch {
            source: PortalError::NotFound(_),
            ..
        }
    ));

    let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
    assert!(matches!(last, QueryEvent::QueryFailed { ref kind, .. } if kind == "package_fetch"));
}

#[tokio::test]
async fn test_planning_errors_surface_before_execution() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invoked);
    let invoker = FnInvoker::new().with("balance", move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(json!(0))
    });
    let portals = PortalSet::new()
        .with_naming(StaticNamingPortal::new().with("example.eth", "Qm123"))
        .with_storage(MemoryStoragePortal::new().with("Qm123", manifest()));
    let client = Web3Api::new(
        Web3ApiConfig::new("example.eth")
            .portals(portals)
            .invoker(invoker),
    )
    .unwrap();

    let err = client
        .query_str("query($a: String!, $b: String!) { x: balance(address: $a) y: balance(address: $b) }", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "variable_mismatch");
    assert!(err.to_string().contains("$a"));
    assert!(err.to_string().contains("$b"));

    let err = client.query_str("{ balance(", None).await.unwrap_err();
    assert_eq!(err.kind(), "query_parse");

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_query_leaves_client_untouched() {
    let naming = Portal::Naming(Arc::new(StaticNamingPortal::new().with("example.eth", "Qm123")));
    let storage = Portal::Storage(Arc::new(StalledStorage));
    let portals = PortalSet::new();
    portals.set(PortalName::Naming, naming.clone()).unwrap();
    portals.set(PortalName::Storage, storage.clone()).unwrap();
    let client = Web3Api::new(Web3ApiConfig::new("example.eth").portals(portals)).unwrap();

    {
        let mut fut = task::spawn(client.query_str("{ balance(address: \"0xabc\") }", None));
        assert_pending!(fut.poll());
        // Dropped mid-fetch.
    }

    assert_eq!(client.endpoint(), Endpoint::NamingDomain("example.eth".into()));
    assert!(client.get_portal("naming").unwrap().unwrap().ptr_eq(&naming));
    assert!(client.get_portal("storage").unwrap().unwrap().ptr_eq(&storage));
}

#[tokio::test]
async fn test_portal_swap_applies_to_later_queries() {
    let client = Web3Api::new(
        Web3ApiConfig::new("example.eth")
            .portals(
                PortalSet::new()
                    .with_naming(StaticNamingPortal::new().with("example.eth", "QmOld"))
                    .with_storage(MemoryStoragePortal::new().with("QmNew", manifest())),
            )
            .invoker(balance_invoker()),
    )
    .unwrap();

    assert_eq!(client.resolve().await.unwrap().as_str(), "QmOld");

    client
        .set_portal(
            "ens",
            Portal::Naming(Arc::new(StaticNamingPortal::new().with("example.eth", "QmNew"))),
        )
        .unwrap();
    let plan = client
        .plan(&"{ balance(address: \"0xabc\") }".parse().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(plan.package.as_str(), "QmNew");
}
