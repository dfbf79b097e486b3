//! CLI command tests against a local package store.

use std::fs;

use serde_json::json;
use tempfile::TempDir;

use web3api_cli::commands;
use web3api_cli::Settings;

const CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

// ─────────────────────── helpers ───────────────────────

/// A store directory holding one package, plus a names file pointing at it.
fn fixture() -> (TempDir, Settings) {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    fs::create_dir(&store).unwrap();

    let manifest = json!({
        "name": "erc20",
        "version": "1.2.0",
        "modules": { "query": { "path": "query.wasm" } },
        "schema": {
            "types": { "Token": { "fields": { "symbol": { "type": "String!" } } } },
            "query": {
                "balance": {
                    "type": "Int",
                    "args": [{ "name": "address", "type": "String!" }],
                    "module": "query",
                    "entry": "balanceOf"
                },
                "token": { "type": "Token", "module": "query" },
                "echo": { "type": "JSON", "args": [{ "name": "input", "type": "JSON" }], "module": "query" }
            }
        }
    });
    fs::write(store.join(format!("{CID}.json")), manifest.to_string()).unwrap();

    let names = dir.path().join("names.json");
    fs::write(&names, json!({ "example.eth": CID }).to_string()).unwrap();

    let settings = Settings {
        gateway: "http://127.0.0.1:9".to_string(),
        store: Some(store),
        names: Some(names),
    };
    (dir, settings)
}

// ─────────────────────── tests ───────────────────────

#[tokio::test]
async fn test_resolve_through_names_file() {
    let (_dir, settings) = fixture();
    let client = commands::client("example.eth", &settings).unwrap();
    let report = commands::resolve(&client).await.unwrap();
    assert_eq!(report.address, CID);
    assert_eq!(report.to_string(), format!("example.eth -> {CID}"));
}

#[tokio::test]
async fn test_inspect_summarizes_schema() {
    let (_dir, settings) = fixture();
    let client = commands::client(CID, &settings).unwrap();
    let report = commands::inspect(&client).await.unwrap();

    assert_eq!(report.name, "erc20");
    assert_eq!(report.version.as_deref(), Some("1.2.0"));
    assert_eq!(report.modules, vec!["query"]);
    assert_eq!(report.types, vec!["Token"]);
    assert!(report
        .query
        .contains(&"balance(address: String!): Int -> query#balanceOf".to_string()));

    let text = report.to_string();
    assert!(text.starts_with(&format!("erc20 1.2.0 ({CID})")));
}

#[tokio::test]
async fn test_plan_with_query_and_vars_files() {
    let (dir, settings) = fixture();
    let query = dir.path().join("q.graphql");
    fs::write(
        &query,
        "query($a: String!) { b: balance(address: $a) e: echo(input: @b) t: token { symbol } }",
    )
    .unwrap();
    let vars = dir.path().join("vars.json");
    fs::write(&vars, r#"{ "a": "0xabc" }"#).unwrap();

    let query_arg = format!("@{}", query.display());
    let vars_arg = format!("@{}", vars.display());

    let client = commands::client("example.eth", &settings).unwrap();
    let report = commands::plan(&client, &query_arg, Some(vars_arg.as_str()))
        .await
        .unwrap();

    assert_eq!(report.plan.order(), vec!["b", "e", "t"]);
    let text = report.to_string();
    assert!(text.contains("b = "));
    assert!(text.contains("#balanceOf(address: \"0xabc\")"));
    assert!(text.contains("after b"));

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["package"], CID);
    assert_eq!(value["keys"], json!(["b", "e", "t"]));
}

#[tokio::test]
async fn test_plan_reports_missing_variables() {
    let (_dir, settings) = fixture();
    let client = commands::client(CID, &settings).unwrap();
    let err = commands::plan(&client, "{ balance(address: $addr) }", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("$addr"));
}

#[test]
fn test_invalid_uri_fails_client_construction() {
    let (_dir, settings) = fixture();
    assert!(commands::client("not-an-api", &settings).is_err());
    assert!(!commands::check("not-an-api").valid);
}

#[test]
fn test_missing_names_file_is_reported() {
    let (dir, mut settings) = fixture();
    settings.names = Some(dir.path().join("absent.json"));
    let err = commands::client("example.eth", &settings).err().unwrap();
    assert!(err.to_string().contains("naming records"));
}
