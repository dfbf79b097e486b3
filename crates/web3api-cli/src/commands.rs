//! Command implementations. Each returns a report that prints as text or JSON.

use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use web3api::identifier::IdentifierKind;
use web3api::query::{ArgumentValue, ExecutionPlan};
use web3api::{
    ApiPackage, Endpoint, FsStoragePortal, GatewayStoragePortal, PortalSet, StaticNamingPortal,
    Variables, Web3Api, Web3ApiConfig,
};

use crate::config::{read_arg, Settings};

/// Install portals according to `settings`.
pub fn portals(settings: &Settings) -> Result<PortalSet> {
    let mut set = PortalSet::new();

    set = match &settings.store {
        Some(dir) => {
            tracing::debug!("Using package store {}", dir.display());
            set.with_storage(FsStoragePortal::new(dir))
        }
        None => {
            tracing::debug!("Using gateway {}", settings.gateway);
            set.with_storage(GatewayStoragePortal::new(&settings.gateway))
        }
    };

    if let Some(path) = &settings.names {
        let names = StaticNamingPortal::from_file(path)
            .with_context(|| format!("Failed to load naming records from {}", path.display()))?;
        tracing::debug!("Loaded {} naming records", names.len());
        set = set.with_naming(names);
    }

    Ok(set)
}

/// Build a client for `uri`.
pub fn client(uri: &str, settings: &Settings) -> Result<Web3Api> {
    let config = Web3ApiConfig::new(uri).portals(portals(settings)?);
    Ok(Web3Api::new(config)?)
}

// ── check ──

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub input: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<IdentifierKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

pub fn check(uri: &str) -> CheckReport {
    let endpoint = Endpoint::parse(uri).ok();
    CheckReport {
        input: uri.to_string(),
        valid: endpoint.is_some(),
        kind: endpoint.as_ref().map(Endpoint::kind),
        endpoint: endpoint.map(|e| e.to_string()),
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.endpoint) {
            (Some(IdentifierKind::ContentAddress), Some(e)) => write!(f, "{e}: IPFS content address"),
            (Some(IdentifierKind::NamingDomain), Some(e)) => write!(f, "{e}: ENS domain"),
            _ => write!(f, "{}: not a Web3API identifier", self.input),
        }
    }
}

// ── resolve ──

#[derive(Debug, Serialize)]
pub struct ResolveReport {
    pub endpoint: String,
    pub address: String,
}

pub async fn resolve(client: &Web3Api) -> Result<ResolveReport> {
    let address = client.resolve().await?;
    Ok(ResolveReport {
        endpoint: client.endpoint().to_string(),
        address: address.to_string(),
    })
}

impl fmt::Display for ResolveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.endpoint == self.address {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} -> {}", self.endpoint, self.address)
        }
    }
}

// ── inspect ──

#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub address: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub modules: Vec<String>,
    /// `field(arg: Type, ...): Type -> module#entry`
    pub query: Vec<String>,
    pub types: Vec<String>,
}

pub async fn inspect(client: &Web3Api) -> Result<InspectReport> {
    let package = client.package().await?;
    Ok(summarize(&package))
}

pub fn summarize(package: &ApiPackage) -> InspectReport {
    let query = package
        .schema
        .query
        .iter()
        .map(|(name, field)| {
            let args = field
                .args
                .iter()
                .map(|a| format!("{}: {}", a.name, a.type_ref))
                .collect::<Vec<_>>()
                .join(", ");
            let signature = if args.is_empty() {
                format!("{name}: {}", field.type_ref)
            } else {
                format!("{name}({args}): {}", field.type_ref)
            };
            match package.module_ref(name, field) {
                Some(m) => format!("{signature} -> {}#{}", m.module, m.entry),
                None => format!("{signature} (unbound)"),
            }
        })
        .collect();

    InspectReport {
        address: package.address().to_string(),
        name: package.name.clone(),
        version: package.version.clone(),
        modules: package.modules.keys().cloned().collect(),
        query,
        types: package.schema.types.keys().cloned().collect(),
    }
}

impl fmt::Display for InspectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => writeln!(f, "{} {v} ({})", self.name, self.address)?,
            None => writeln!(f, "{} ({})", self.name, self.address)?,
        }
        writeln!(f, "  Modules: {}", self.modules.join(", "))?;
        if !self.types.is_empty() {
            writeln!(f, "  Types: {}", self.types.join(", "))?;
        }
        writeln!(f, "  Query:")?;
        for line in &self.query {
            writeln!(f, "    {line}")?;
        }
        Ok(())
    }
}

// ── plan ──

#[derive(Debug, Serialize)]
pub struct PlanReport {
    #[serde(flatten)]
    pub plan: ExecutionPlan,
}

/// Plan `query` (inline text or `@file`) with optional `vars` (JSON or `@file`).
pub async fn plan(client: &Web3Api, query: &str, vars: Option<&str>) -> Result<PlanReport> {
    let source = read_arg(query).context("Failed to read query")?;
    let doc = web3api::query::parse(&source)?;
    let variables = vars.map(parse_variables).transpose()?;
    let plan = client.plan(&doc, variables.as_ref()).await?;
    Ok(PlanReport { plan })
}

/// Parse a JSON object of variable bindings, inline or from `@file`.
pub fn parse_variables(arg: &str) -> Result<Variables> {
    let text = read_arg(arg).context("Failed to read variables")?;
    match serde_json::from_str::<Value>(&text).context("Variables are not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Variables must be a JSON object, got {other}"),
    }
}

impl fmt::Display for PlanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan for {} ({} steps)", self.plan.package, self.plan.steps.len())?;
        for (n, step) in self.plan.steps.iter().enumerate() {
            let args = step
                .arguments
                .iter()
                .map(|a| format!("{}: {}", a.name, describe_argument(&a.value)))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "  {}. {} = {}({args})", n + 1, step.key, step.module)?;
            if !step.depends_on.is_empty() {
                write!(f, " after {}", step.depends_on.join(", "))?;
            }
            writeln!(f, " : {}", step.result_type)?;
        }
        Ok(())
    }
}

fn describe_argument(value: &ArgumentValue) -> String {
    match value {
        ArgumentValue::Const(v) => v.to_string(),
        ArgumentValue::Sibling(key) => format!("@{key}"),
        ArgumentValue::List(items) => format!(
            "[{}]",
            items.iter().map(describe_argument).collect::<Vec<_>>().join(", ")
        ),
        ArgumentValue::Object(fields) => format!(
            "{{{}}}",
            fields
                .iter()
                .map(|(k, v)| format!("{k}: {}", describe_argument(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_report() {
        let ok = check("w3://ens/Example.eth");
        assert!(ok.valid);
        assert_eq!(ok.kind, Some(IdentifierKind::NamingDomain));
        assert_eq!(ok.to_string(), "example.eth: ENS domain");

        let bad = check("example.com");
        assert!(!bad.valid);
        assert!(bad.to_string().contains("not a Web3API identifier"));
    }

    #[test]
    fn test_parse_variables_requires_object() {
        let vars = parse_variables(r#"{"addr": "0xabc"}"#).unwrap();
        assert_eq!(vars["addr"], "0xabc");
        assert!(parse_variables("[1, 2]").is_err());
        assert!(parse_variables("not json").is_err());
    }

    #[test]
    fn test_describe_argument() {
        let value = ArgumentValue::List(vec![
            ArgumentValue::Sibling("a".into()),
            ArgumentValue::Const(serde_json::json!("x")),
        ]);
        assert_eq!(describe_argument(&value), "[@a, \"x\"]");
    }
}
