//! Library configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::module::{ModuleInvoker, NoopInvoker};
use crate::portals::PortalSet;

/// Default bound on concurrently running plan steps.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default event bus buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Deepest list, object or selection nesting accepted in query text and
/// manifest type strings.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Plan executor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Steps allowed in flight at once. `1` runs strictly sequentially.
    pub max_concurrency: usize,
    /// Per-step deadline. `None` waits indefinitely.
    pub step_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            step_timeout: None,
        }
    }
}

impl ExecutorConfig {
    pub fn sequential() -> Self {
        Self {
            max_concurrency: 1,
            ..Self::default()
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// Everything needed to construct a [`crate::Web3Api`] client.
pub struct Web3ApiConfig {
    /// Endpoint identifier (ENS domain or IPFS content address).
    pub uri: String,
    pub portals: PortalSet,
    pub invoker: Arc<dyn ModuleInvoker>,
    pub executor: ExecutorConfig,
    pub event_capacity: usize,
}

impl Web3ApiConfig {
    /// Config for `uri` with no portals installed and no module runtime.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            portals: PortalSet::new(),
            invoker: Arc::new(NoopInvoker),
            executor: ExecutorConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn portals(mut self, portals: PortalSet) -> Self {
        self.portals = portals;
        self
    }

    pub fn invoker(mut self, invoker: impl ModuleInvoker + 'static) -> Self {
        self.invoker = Arc::new(invoker);
        self
    }

    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }
}
