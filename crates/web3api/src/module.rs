//! Module invocation seam.
//!
//! The client never runs package modules itself; a [`ModuleInvoker`] does.
//! A wasm runtime, an RPC bridge or a test double can sit behind it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::package::ModuleRef;

/// Failure raised by a module invocation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    #[error("Module {0} is not available")]
    ModuleUnavailable(String),

    #[error("Module call failed: {0}")]
    Failed(String),
}

/// Calls one function of one package module with named arguments.
#[async_trait]
pub trait ModuleInvoker: Send + Sync {
    async fn invoke(
        &self,
        module: &ModuleRef,
        args: &Map<String, Value>,
    ) -> Result<Value, InvocationError>;
}

type Handler = Arc<dyn Fn(&Map<String, Value>) -> Result<Value, InvocationError> + Send + Sync>;

/// Invoker backed by plain closures keyed by entry point name.
///
/// Useful for embedding native implementations of a package's functions and
/// for tests.
#[derive(Default, Clone)]
pub struct FnInvoker {
    handlers: HashMap<String, Handler>,
}

impl FnInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` for the entry point `entry`.
    pub fn with<F>(mut self, entry: &str, f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Value, InvocationError> + Send + Sync + 'static,
    {
        self.handlers.insert(entry.to_string(), Arc::new(f));
        self
    }
}

#[async_trait]
impl ModuleInvoker for FnInvoker {
    async fn invoke(
        &self,
        module: &ModuleRef,
        args: &Map<String, Value>,
    ) -> Result<Value, InvocationError> {
        let handler = self
            .handlers
            .get(&module.entry)
            .ok_or_else(|| InvocationError::ModuleUnavailable(module.to_string()))?;
        handler(args)
    }
}

/// Invoker for hosts with no module runtime. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvoker;

#[async_trait]
impl ModuleInvoker for NoopInvoker {
    async fn invoke(
        &self,
        module: &ModuleRef,
        _args: &Map<String, Value>,
    ) -> Result<Value, InvocationError> {
        Err(InvocationError::ModuleUnavailable(module.to_string()))
    }
}
