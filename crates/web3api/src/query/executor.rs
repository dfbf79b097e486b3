//! Plan executor: runs plan steps against a module invoker.
//!
//! Steps whose dependencies are satisfied run concurrently up to
//! `max_concurrency`. A failed step never aborts its siblings: anything that
//! depends on it, directly or transitively, is skipped without being invoked.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::events::{EventBus, QueryEvent};
use crate::module::{InvocationError, ModuleInvoker};
use crate::query::planner::{ExecutionPlan, PlanStep, Projection};
use crate::schema::{describe_value, ApiSchema, TypeRef};

/// Lifecycle of one plan step.
///
/// `Pending → Running → Succeeded | Failed`, or `Pending → Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Failed | StepState::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorKind {
    /// The module invoker returned an error.
    Invocation,
    /// The step exceeded `step_timeout`.
    Timeout,
    /// The module result does not fit the declared type or selection.
    ResultShape,
}

/// Why one field has no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub kind: FieldErrorKind,
    pub message: String,
}

impl FieldError {
    fn timeout(after: Duration) -> Self {
        Self {
            kind: FieldErrorKind::Timeout,
            message: format!("step timed out after {}ms", after.as_millis()),
        }
    }

    fn shape(message: String) -> Self {
        Self {
            kind: FieldErrorKind::ResultShape,
            message,
        }
    }
}

impl From<InvocationError> for FieldError {
    fn from(e: InvocationError) -> Self {
        Self {
            kind: FieldErrorKind::Invocation,
            message: e.to_string(),
        }
    }
}

/// Terminal state of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldOutcome {
    Succeeded { value: Value },
    Failed { error: FieldError },
    /// Never attempted because these dependencies did not succeed.
    Skipped { blocked_by: Vec<String> },
}

impl FieldOutcome {
    pub fn state(&self) -> StepState {
        match self {
            FieldOutcome::Succeeded { .. } => StepState::Succeeded,
            FieldOutcome::Failed { .. } => StepState::Failed,
            FieldOutcome::Skipped { .. } => StepState::Skipped,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            FieldOutcome::Succeeded { value } => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    pub key: String,
    #[serde(flatten)]
    pub outcome: FieldOutcome,
}

/// Outcome of every root field, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub query_id: Uuid,
    pub fields: Vec<FieldResult>,
}

impl ExecutionResult {
    pub fn get(&self, key: &str) -> Option<&FieldOutcome> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.outcome)
    }

    /// True when every field succeeded.
    pub fn is_ok(&self) -> bool {
        self.fields
            .iter()
            .all(|f| matches!(f.outcome, FieldOutcome::Succeeded { .. }))
    }

    /// Object of response key to value; fields without a value are null.
    pub fn data(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|f| (f.key.clone(), f.outcome.value().cloned().unwrap_or(Value::Null)))
                .collect(),
        )
    }

    /// Fields that failed or were skipped.
    pub fn errors(&self) -> Vec<&FieldResult> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.outcome, FieldOutcome::Succeeded { .. }))
            .collect()
    }

    /// `{ "data": ..., "errors": [...] }`, with `errors` omitted when empty.
    pub fn to_response(&self) -> Value {
        let mut response = Map::new();
        response.insert("data".to_string(), self.data());
        let errors = self.errors();
        if !errors.is_empty() {
            response.insert(
                "errors".to_string(),
                serde_json::to_value(errors).unwrap_or(Value::Null),
            );
        }
        Value::Object(response)
    }
}

/// Runs an [`ExecutionPlan`].
pub struct PlanExecutor {
    invoker: Arc<dyn ModuleInvoker>,
    config: ExecutorConfig,
    events: Option<EventBus>,
    query_id: Uuid,
}

type StepOutput = (usize, Result<Value, FieldError>);

impl PlanExecutor {
    pub fn new(invoker: Arc<dyn ModuleInvoker>, config: ExecutorConfig) -> Self {
        Self {
            invoker,
            config,
            events: None,
            query_id: Uuid::new_v4(),
        }
    }

    /// Report transitions on `events` under `query_id`.
    pub fn with_events(mut self, events: EventBus, query_id: Uuid) -> Self {
        self.events = Some(events);
        self.query_id = query_id;
        self
    }

    pub async fn execute(&self, plan: &ExecutionPlan, schema: &ApiSchema) -> ExecutionResult {
        let started = Instant::now();
        let steps = &plan.steps;
        let position: HashMap<&str, usize> =
            steps.iter().enumerate().map(|(i, s)| (s.key.as_str(), i)).collect();

        let mut states = vec![StepState::Pending; steps.len()];
        let mut remaining: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(&d) = position.get(dep.as_str()) {
                    dependents[d].push(i);
                }
            }
        }

        let mut raw: HashMap<String, Value> = HashMap::new();
        let mut outcomes: HashMap<usize, FieldOutcome> = HashMap::new();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut in_flight = FuturesUnordered::new();
        let limit = self.config.max_concurrency.max(1);

        loop {
            while in_flight.len() < limit {
                let Some(Reverse(i)) = ready.pop() else { break };
                if states[i] != StepState::Pending {
                    continue;
                }
                let args = steps[i]
                    .arguments
                    .iter()
                    .map(|a| (a.name.clone(), a.value.resolve(&raw)))
                    .collect();
                self.transition(&steps[i], &mut states[i], StepState::Running);
                in_flight.push(self.run_step(i, &steps[i], args));
            }

            let Some((i, result)) = in_flight.next().await else {
                break;
            };
            let step = &steps[i];

            let result = result.and_then(|value| {
                let shaped = shape(schema, value.clone(), &step.result_type, step.projection.as_ref(), &step.key)
                    .map_err(FieldError::shape)?;
                Ok((value, shaped))
            });

            match result {
                Ok((value, shaped)) => {
                    self.transition(step, &mut states[i], StepState::Succeeded);
                    raw.insert(step.key.clone(), value);
                    outcomes.insert(i, FieldOutcome::Succeeded { value: shaped });
                    for &next in &dependents[i] {
                        remaining[next] -= 1;
                        if remaining[next] == 0 {
                            ready.push(Reverse(next));
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!("Step {} failed: {}", step.key, error.message);
                    self.transition(step, &mut states[i], StepState::Failed);
                    outcomes.insert(i, FieldOutcome::Failed { error });
                    self.skip_dependents(i, steps, &dependents, &position, &mut states, &mut outcomes);
                }
            }
        }

        let fields: Vec<FieldResult> = plan
            .keys
            .iter()
            .map(|key| {
                let outcome = position
                    .get(key.as_str())
                    .and_then(|i| outcomes.remove(i))
                    .unwrap_or(FieldOutcome::Skipped {
                        blocked_by: Vec::new(),
                    });
                FieldResult {
                    key: key.clone(),
                    outcome,
                }
            })
            .collect();

        let count = |state: StepState| fields.iter().filter(|f| f.outcome.state() == state).count();
        let (succeeded, failed, skipped) = (
            count(StepState::Succeeded),
            count(StepState::Failed),
            count(StepState::Skipped),
        );
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Query {} finished in {elapsed_ms}ms: {succeeded} succeeded, {failed} failed, {skipped} skipped",
            self.query_id
        );
        self.emit(QueryEvent::QueryFinished {
            query_id: self.query_id,
            succeeded,
            failed,
            skipped,
            elapsed_ms,
        });

        ExecutionResult {
            query_id: self.query_id,
            fields,
        }
    }

    fn run_step(
        &self,
        index: usize,
        step: &PlanStep,
        args: Map<String, Value>,
    ) -> impl Future<Output = StepOutput> + Send + 'static {
        let invoker = Arc::clone(&self.invoker);
        let module = step.module.clone();
        let timeout = self.config.step_timeout;

        async move {
            let call = invoker.invoke(&module, &args);
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(r) => r.map_err(FieldError::from),
                    Err(_) => Err(FieldError::timeout(limit)),
                },
                None => call.await.map_err(FieldError::from),
            };
            (index, result)
        }
    }

    /// Skip everything downstream of `failed` that has not started.
    fn skip_dependents(
        &self,
        failed: usize,
        steps: &[PlanStep],
        dependents: &[Vec<usize>],
        position: &HashMap<&str, usize>,
        states: &mut [StepState],
        outcomes: &mut HashMap<usize, FieldOutcome>,
    ) {
        let mut queue = vec![failed];
        while let Some(current) = queue.pop() {
            for &next in &dependents[current] {
                if states[next] != StepState::Pending {
                    continue;
                }
                let blocked_by: Vec<String> = steps[next]
                    .depends_on
                    .iter()
                    .filter(|d| {
                        position.get(d.as_str()).is_some_and(|&p| {
                            p == current || matches!(states[p], StepState::Failed | StepState::Skipped)
                        })
                    })
                    .cloned()
                    .collect();
                self.transition(&steps[next], &mut states[next], StepState::Skipped);
                outcomes.insert(next, FieldOutcome::Skipped { blocked_by });
                queue.push(next);
            }
        }
    }

    fn transition(&self, step: &PlanStep, state: &mut StepState, to: StepState) {
        let from = std::mem::replace(state, to);
        tracing::debug!("Step {} ({}): {from:?} -> {to:?}", step.key, step.module);
        self.emit(QueryEvent::StepTransition {
            query_id: self.query_id,
            step: step.key.clone(),
            from,
            to,
        });
    }

    fn emit(&self, event: QueryEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

/// Check `value` against `ty` and apply `projection` to object values.
fn shape(
    schema: &ApiSchema,
    value: Value,
    ty: &TypeRef,
    projection: Option<&Projection>,
    path: &str,
) -> Result<Value, String> {
    match ty {
        TypeRef::NonNull(inner) => {
            if value.is_null() {
                return Err(format!("{path}: expected {ty}, found null"));
            }
            shape(schema, value, inner, projection, path)
        }
        _ if value.is_null() => Ok(Value::Null),
        TypeRef::List(inner) => match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| shape(schema, item, inner, projection, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(format!("{path}: expected {ty}, found {}", describe_value(&other))),
        },
        TypeRef::Named(name) => match (projection, value) {
            (Some(projection), Value::Object(mut map)) => {
                let mut out = Map::new();
                for field in &projection.fields {
                    let v = map.remove(&field.name).unwrap_or(Value::Null);
                    let v = shape(
                        schema,
                        v,
                        &field.type_ref,
                        field.projection.as_ref(),
                        &format!("{path}.{}", field.key),
                    )?;
                    out.insert(field.key.clone(), v);
                }
                Ok(Value::Object(out))
            }
            (Some(_), other) => Err(format!("{path}: expected {name}, found {}", describe_value(&other))),
            (None, v) if schema.value_matches(&v, ty) => Ok(v),
            (None, other) => Err(format!("{path}: expected {name}, found {}", describe_value(&other))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::ContentAddress;
    use crate::module::FnInvoker;
    use crate::package::{ApiPackage, ModuleRef};
    use crate::query::{parser::parse, planner::plan};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn package() -> ApiPackage {
        let manifest = json!({
            "name": "test",
            "modules": { "m": { "path": "m.wasm" } },
            "schema": {
                "types": {
                    "Token": { "fields": {
                        "symbol": { "type": "String!" },
                        "decimals": { "type": "Int" }
                    }}
                },
                "query": {
                    "ok": { "type": "Int!", "module": "m" },
                    "fail": { "type": "Int", "module": "m" },
                    "echo": { "type": "JSON", "args": [{ "name": "input", "type": "JSON" }], "module": "m" },
                    "token": { "type": "Token!", "module": "m" },
                    "tokens": { "type": "[Token!]!", "module": "m" },
                    "slow": { "type": "Int", "module": "m" }
                }
            }
        });
        ApiPackage::decode(&ContentAddress::new("QmTest"), &serde_json::to_vec(&manifest).unwrap())
            .unwrap()
    }

    fn invoker() -> FnInvoker {
        FnInvoker::new()
            .with("ok", |_| Ok(json!(1)))
            .with("fail", |_| Err(InvocationError::Failed("boom".into())))
            .with("echo", |args| Ok(args.get("input").cloned().unwrap_or(Value::Null)))
            .with("token", |_| Ok(json!({ "symbol": "DAI", "decimals": 18, "extra": true })))
            .with("tokens", |_| Ok(json!([{ "symbol": "A" }, { "symbol": "B", "decimals": 2 }])))
    }

    async fn run(query: &str, invoker: impl ModuleInvoker + 'static, config: ExecutorConfig) -> ExecutionResult {
        let package = package();
        let plan = plan(&parse(query).unwrap(), &Map::new(), &package).unwrap();
        PlanExecutor::new(Arc::new(invoker), config)
            .execute(&plan, &package.schema)
            .await
    }

    /// Sleeps, then returns 1, tracking the peak number of concurrent calls.
    struct SlowInvoker {
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowInvoker {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModuleInvoker for Arc<SlowInvoker> {
        async fn invoke(&self, _: &ModuleRef, _: &Map<String, Value>) -> Result<Value, InvocationError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(1))
        }
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let result = run(
            "{ x: fail y: echo(input: @x) w: echo(input: @y) z: ok }",
            invoker(),
            ExecutorConfig::default(),
        )
        .await;

        assert!(matches!(
            result.get("x"),
            Some(FieldOutcome::Failed { error }) if error.kind == FieldErrorKind::Invocation
        ));
        assert_eq!(
            result.get("y"),
            Some(&FieldOutcome::Skipped {
                blocked_by: vec!["x".into()]
            })
        );
        assert_eq!(
            result.get("w"),
            Some(&FieldOutcome::Skipped {
                blocked_by: vec!["y".into()]
            })
        );
        assert_eq!(result.get("z"), Some(&FieldOutcome::Succeeded { value: json!(1) }));
        assert!(!result.is_ok());
        assert_eq!(result.errors().len(), 3);
    }

    #[tokio::test]
    async fn test_sibling_receives_raw_result() {
        let result = run(
            "{ t: token { symbol } copy: echo(input: @t) }",
            invoker(),
            ExecutorConfig::default(),
        )
        .await;
        assert_eq!(result.get("t").unwrap().value(), Some(&json!({ "symbol": "DAI" })));
        assert_eq!(
            result.get("copy").unwrap().value(),
            Some(&json!({ "symbol": "DAI", "decimals": 18, "extra": true }))
        );
    }

    #[tokio::test]
    async fn test_projection_over_lists() {
        let result = run("{ tokens { s: symbol decimals } }", invoker(), ExecutorConfig::default()).await;
        assert_eq!(
            result.data(),
            json!({ "tokens": [{ "s": "A", "decimals": null }, { "s": "B", "decimals": 2 }] })
        );
    }

    #[tokio::test]
    async fn test_result_shape_mismatch_fails_field() {
        let bad = FnInvoker::new()
            .with("ok", |_| Ok(json!("not an int")))
            .with("token", |_| Ok(json!({ "decimals": 1 })));
        let result = run("{ ok token { symbol } }", bad, ExecutorConfig::default()).await;
        for key in ["ok", "token"] {
            assert!(matches!(
                result.get(key),
                Some(FieldOutcome::Failed { error }) if error.kind == FieldErrorKind::ResultShape
            ));
        }
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let slow = Arc::new(SlowInvoker::new(Duration::from_secs(5)));
        let result = run(
            "{ slow }",
            slow,
            ExecutorConfig::default().with_step_timeout(Duration::from_millis(20)),
        )
        .await;
        assert!(matches!(
            result.get("slow"),
            Some(FieldOutcome::Failed { error }) if error.kind == FieldErrorKind::Timeout
        ));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let query = "{ a: slow b: slow c: slow d: slow }";

        let slow = Arc::new(SlowInvoker::new(Duration::from_millis(30)));
        let config = ExecutorConfig {
            max_concurrency: 2,
            step_timeout: None,
        };
        let result = run(query, Arc::clone(&slow), config).await;
        assert!(result.is_ok());
        assert_eq!(slow.peak.load(Ordering::SeqCst), 2);

        let slow = Arc::new(SlowInvoker::new(Duration::from_millis(5)));
        run(query, Arc::clone(&slow), ExecutorConfig::sequential()).await;
        assert_eq!(slow.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_emitted() {
        let package = package();
        let plan = plan(&parse("{ x: fail y: echo(input: @x) }").unwrap(), &Map::new(), &package).unwrap();
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        PlanExecutor::new(Arc::new(invoker()), ExecutorConfig::default())
            .with_events(bus, id)
            .execute(&plan, &package.schema)
            .await;

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.query_id(), id);
            if let QueryEvent::StepTransition { step, from, to, .. } = event {
                transitions.push((step, from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                ("x".to_string(), StepState::Pending, StepState::Running),
                ("x".to_string(), StepState::Running, StepState::Failed),
                ("y".to_string(), StepState::Pending, StepState::Skipped),
            ]
        );
    }

    #[test]
    fn test_response_shape() {
        let result = ExecutionResult {
            query_id: Uuid::nil(),
            fields: vec![
                FieldResult {
                    key: "a".into(),
                    outcome: FieldOutcome::Succeeded { value: json!(42) },
                },
                FieldResult {
                    key: "b".into(),
                    outcome: FieldOutcome::Skipped {
                        blocked_by: vec!["c".into()],
                    },
                },
            ],
        };
        assert_eq!(
            result.to_response(),
            json!({
                "data": { "a": 42, "b": null },
                "errors": [{ "key": "b", "status": "skipped", "blocked_by": ["c"] }]
            })
        );
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }
}
