//! Error types for the client, the portals and the query planner.
//!
//! Everything here is raised *before* any module is invoked. Failures that
//! happen while a plan runs are field-scoped and live in
//! [`crate::query::executor::FieldError`] instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::portals::PortalName;

/// Errors that abort a whole client call.
#[derive(thiserror::Error, Debug)]
pub enum Web3ApiError {
    #[error("The Web3API URI provided is neither an ENS domain nor an IPFS multihash: {0}")]
    InvalidIdentifier(String),

    #[error("Package fetch failed for {target}: {source}")]
    PackageFetch {
        target: String,
        #[source]
        source: PortalError,
    },

    #[error("Package decode failed for {address}: {reason}")]
    PackageDecode { address: String, reason: String },

    #[error(transparent)]
    QueryParse(#[from] ParseError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("No {0} portal configured")]
    MissingPortal(PortalName),

    #[error("Portal kind mismatch: cannot install a {found} portal under '{name}'")]
    PortalMismatch { name: PortalName, found: PortalName },

    #[error("Unknown portal name: {0}")]
    UnknownPortal(String),
}

impl Web3ApiError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Web3ApiError::InvalidIdentifier(_) => "invalid_identifier",
            Web3ApiError::PackageFetch { .. } => "package_fetch",
            Web3ApiError::PackageDecode { .. } => "package_decode",
            Web3ApiError::QueryParse(_) => "query_parse",
            Web3ApiError::Plan(e) => e.kind(),
            Web3ApiError::MissingPortal(_) => "missing_portal",
            Web3ApiError::PortalMismatch { .. } => "portal_mismatch",
            Web3ApiError::UnknownPortal(_) => "unknown_portal",
        }
    }
}

/// Convenience result type.
pub type Web3ApiResult<T> = Result<T, Web3ApiError>;

/// Errors reported by naming and storage portals.
#[derive(thiserror::Error, Debug)]
pub enum PortalError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed portal data: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A syntax error in query source text.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Query syntax error at position {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// What is wrong with one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum VariableIssue {
    /// Referenced by the query but not bound, no default, non-null type.
    Missing { expected: String },
    /// Bound to a value that does not satisfy the expected type.
    TypeMismatch { expected: String, found: String },
    /// Declared with a type the argument it is passed to cannot accept.
    IncompatibleUsage {
        declared: String,
        field: String,
        argument: String,
        expected: String,
    },
}

/// A variable name together with its issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMismatch {
    pub name: String,
    #[serde(flatten)]
    pub issue: VariableIssue,
}

impl fmt::Display for VariableMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issue {
            VariableIssue::Missing { expected } => {
                write!(f, "${} is missing (expected {expected})", self.name)
            }
            VariableIssue::TypeMismatch { expected, found } => {
                write!(f, "${} expected {expected}, found {found}", self.name)
            }
            VariableIssue::IncompatibleUsage {
                declared,
                field,
                argument,
                expected,
            } => write!(
                f,
                "${} declared as {declared} but {field}({argument}:) expects {expected}",
                self.name
            ),
        }
    }
}

/// Planning failures. Planning is pure, so none of these has side effects.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Variable mismatch: {}", join_display(.0, "; "))]
    VariableMismatch(Vec<VariableMismatch>),

    #[error("Unknown field '{field}' on type {type_name}")]
    UnknownField { type_name: String, field: String },

    #[error("Field '{0}' has no module binding")]
    UnboundField(String),

    #[error("Unknown argument '{argument}' on field '{field}'")]
    UnknownArgument { field: String, argument: String },

    #[error("Missing required argument '{argument}' on field '{field}'")]
    MissingArgument { field: String, argument: String },

    #[error("Argument '{argument}' on field '{field}' expects {expected}, found {found}")]
    ArgumentType {
        field: String,
        argument: String,
        expected: String,
        found: String,
    },

    #[error("Invalid selection at '{path}': {reason}")]
    InvalidSelection { path: String, reason: String },

    #[error("Duplicate response key '{0}'")]
    DuplicateResponseKey(String),

    #[error("Field '{field}' references unknown sibling '@{reference}'")]
    UnresolvedReference { field: String, reference: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    PlanCycle(Vec<String>),
}

impl PlanError {
    pub fn kind(&self) -> &'static str {
        match self {
            PlanError::VariableMismatch(_) => "variable_mismatch",
            PlanError::UnknownField { .. } => "unknown_field",
            PlanError::UnboundField(_) => "unbound_field",
            PlanError::UnknownArgument { .. } => "unknown_argument",
            PlanError::MissingArgument { .. } => "missing_argument",
            PlanError::ArgumentType { .. } => "argument_type",
            PlanError::InvalidSelection { .. } => "invalid_selection",
            PlanError::DuplicateResponseKey(_) => "duplicate_response_key",
            PlanError::UnresolvedReference { .. } => "unresolved_reference",
            PlanError::PlanCycle(_) => "plan_cycle",
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_mismatch_lists_every_name() {
        let err = PlanError::VariableMismatch(vec![
            VariableMismatch {
                name: "a".into(),
                issue: VariableIssue::Missing {
                    expected: "String!".into(),
                },
            },
            VariableMismatch {
                name: "b".into(),
                issue: VariableIssue::TypeMismatch {
                    expected: "Int".into(),
                    found: "string".into(),
                },
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("$a is missing"));
        assert!(msg.contains("$b expected Int, found string"));
    }

    #[test]
    fn test_cycle_message() {
        let err = PlanError::PlanCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
        assert_eq!(Web3ApiError::from(err).kind(), "plan_cycle");
    }
}
