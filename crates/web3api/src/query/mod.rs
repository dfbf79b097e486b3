//! Query pipeline: parse → plan → execute.

pub mod executor;
pub mod parser;
pub mod planner;

pub use executor::{
    ExecutionResult, FieldError, FieldErrorKind, FieldOutcome, FieldResult, PlanExecutor, StepState,
};
pub use parser::{parse, Argument, InputValue, QueryDocument, Selection, VariableDefinition};
pub use planner::{
    plan, ArgumentValue, ExecutionPlan, PlanArgument, PlanStep, ProjectedField, Projection, Variables,
};
