//! Query planner: turns a parsed document into an execution plan.
//!
//! Planning is pure: the same document, variables and package always yield
//! the same plan or the same error. Only root selections become steps;
//! nested selections are projections applied to a step's result.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PlanError, VariableIssue, VariableMismatch};
use crate::identifier::ContentAddress;
use crate::package::{ApiPackage, ModuleRef};
use crate::query::parser::{InputValue, QueryDocument, Selection};
use crate::schema::{describe_value, ApiSchema, FieldDef, TypeRef, QUERY_ROOT};

/// Variable bindings supplied with a query.
pub type Variables = Map<String, Value>;

/// An ordered, validated plan for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Package the plan was built against.
    pub package: ContentAddress,
    /// Steps in execution (topological) order.
    pub steps: Vec<PlanStep>,
    /// Response keys in document order.
    pub keys: Vec<String>,
}

impl ExecutionPlan {
    pub fn step(&self, key: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Response keys in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.key.as_str()).collect()
    }
}

/// One module invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Position of the selection in the document.
    pub id: usize,
    /// Response key (alias or field name).
    pub key: String,
    /// Query root field being resolved.
    pub field: String,
    pub module: ModuleRef,
    pub arguments: Vec<PlanArgument>,
    /// Keys of sibling steps this step consumes, in document order.
    pub depends_on: Vec<String>,
    pub result_type: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanArgument {
    pub name: String,
    pub value: ArgumentValue,
}

/// An argument value with variables substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgumentValue {
    Const(Value),
    /// Raw result of the sibling step with this key.
    Sibling(String),
    List(Vec<ArgumentValue>),
    Object(Vec<(String, ArgumentValue)>),
}

impl ArgumentValue {
    /// Build the concrete value, pulling sibling results from `results`.
    pub fn resolve(&self, results: &HashMap<String, Value>) -> Value {
        match self {
            ArgumentValue::Const(v) => v.clone(),
            ArgumentValue::Sibling(key) => results.get(key).cloned().unwrap_or(Value::Null),
            ArgumentValue::List(items) => {
                Value::Array(items.iter().map(|i| i.resolve(results)).collect())
            }
            ArgumentValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(results)))
                    .collect(),
            ),
        }
    }

    fn as_const(&self) -> Option<&Value> {
        match self {
            ArgumentValue::Const(v) => Some(v),
            _ => None,
        }
    }

    fn into_const(self) -> Option<Value> {
        match self {
            ArgumentValue::Const(v) => Some(v),
            _ => None,
        }
    }
}

/// Fields to keep from an object result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub fields: Vec<ProjectedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedField {
    /// Key in the projected output.
    pub key: String,
    /// Field name in the module result.
    pub name: String,
    pub type_ref: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection>,
}

/// Plan `doc` against `package` with `variables`.
pub fn plan(
    doc: &QueryDocument,
    variables: &Variables,
    package: &ApiPackage,
) -> Result<ExecutionPlan, PlanError> {
    let schema = &package.schema;

    // Step 1: variables, reported exhaustively.
    let values = check_variables(doc, variables, schema)?;

    // Step 2: root fields in document order.
    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(doc.selections.len());
    for (id, sel) in doc.selections.iter().enumerate() {
        let key = sel.response_key();
        if !seen.insert(key) {
            return Err(PlanError::DuplicateResponseKey(key.to_string()));
        }
        steps.push(plan_root(id, sel, package, &values)?);
    }

    // Step 3: dependencies and ordering.
    let keys: Vec<String> = steps.iter().map(|s| s.key.clone()).collect();
    let index: HashMap<&str, usize> = keys.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();

    let mut refs: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
    for (sel, step) in doc.selections.iter().zip(&mut steps) {
        let mut deps: Vec<usize> = Vec::new();
        for arg in &sel.arguments {
            for sibling in arg.value.siblings() {
                let dep = *index
                    .get(sibling)
                    .ok_or_else(|| PlanError::UnresolvedReference {
                        field: step.key.clone(),
                        reference: sibling.to_string(),
                    })?;
                deps.push(dep);
            }
        }
        deps.sort_unstable();
        deps.dedup();
        step.depends_on = deps.iter().map(|&d| keys[d].clone()).collect();
        refs.push(deps);
    }

    let order = order_steps(&refs, &keys)?;
    let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
    let steps = order.into_iter().filter_map(|i| slots[i].take()).collect();

    Ok(ExecutionPlan {
        package: package.address().clone(),
        steps,
        keys,
    })
}

// ── Variables ──

/// A place a variable is passed: field, argument and the type expected there.
struct Usage<'a> {
    field: &'a str,
    argument: &'a str,
    expected: Option<TypeRef>,
}

fn check_variables(
    doc: &QueryDocument,
    bindings: &Variables,
    schema: &ApiSchema,
) -> Result<HashMap<String, Value>, PlanError> {
    let mut usages: BTreeMap<&str, Vec<Usage>> = BTreeMap::new();
    for sel in &doc.selections {
        let def = schema.query_field(&sel.name);
        for arg in &sel.arguments {
            let expected = def.and_then(|d| d.arg(&arg.name)).map(|a| a.type_ref.clone());
            collect_usages(&arg.value, expected, &sel.name, &arg.name, &mut usages);
        }
    }

    let mut issues = Vec::new();
    let mut values = HashMap::new();

    for (name, uses) in &usages {
        let bound = bindings.get(*name);
        let issue = match doc.variable(name) {
            Some(decl) => {
                let default = decl.default.as_ref().and_then(InputValue::to_const);
                let incompatible = uses.iter().find_map(|u| {
                    let expected = u.expected.as_ref()?;
                    let fits = decl.type_ref.is_assignable_to(expected)
                        || (default.as_ref().is_some_and(|d| !d.is_null())
                            && decl.type_ref.nullable().is_assignable_to(expected.nullable()));
                    (!fits).then(|| VariableIssue::IncompatibleUsage {
                        declared: decl.type_ref.to_string(),
                        field: u.field.to_string(),
                        argument: u.argument.to_string(),
                        expected: expected.to_string(),
                    })
                });

                let value = bound.cloned().or(default);
                incompatible.or_else(|| match &value {
                    None if decl.type_ref.is_non_null() => Some(VariableIssue::Missing {
                        expected: decl.type_ref.to_string(),
                    }),
                    Some(v) if !schema.value_matches(v, &decl.type_ref) => {
                        Some(VariableIssue::TypeMismatch {
                            expected: decl.type_ref.to_string(),
                            found: describe_value(v).to_string(),
                        })
                    }
                    _ => {
                        values.insert(name.to_string(), value.clone().unwrap_or(Value::Null));
                        None
                    }
                })
            }
            // Undeclared: the argument it is passed to decides its type.
            None => {
                let expected: Vec<&TypeRef> = uses.iter().filter_map(|u| u.expected.as_ref()).collect();
                match bound {
                    None => expected
                        .iter()
                        .find(|t| t.is_non_null())
                        .map(|t| VariableIssue::Missing {
                            expected: t.to_string(),
                        })
                        .or_else(|| {
                            values.insert(name.to_string(), Value::Null);
                            None
                        }),
                    Some(v) => expected
                        .iter()
                        .find(|t| !schema.value_matches(v, t))
                        .map(|t| VariableIssue::TypeMismatch {
                            expected: t.to_string(),
                            found: describe_value(v).to_string(),
                        })
                        .or_else(|| {
                            values.insert(name.to_string(), v.clone());
                            None
                        }),
                }
            }
        };

        if let Some(issue) = issue {
            issues.push(VariableMismatch {
                name: name.to_string(),
                issue,
            });
        }
    }

    if issues.is_empty() {
        Ok(values)
    } else {
        Err(PlanError::VariableMismatch(issues))
    }
}

fn collect_usages<'a>(
    value: &'a InputValue,
    expected: Option<TypeRef>,
    field: &'a str,
    argument: &'a str,
    out: &mut BTreeMap<&'a str, Vec<Usage<'a>>>,
) {
    match value {
        InputValue::Variable(name) => out.entry(name).or_default().push(Usage {
            field,
            argument,
            expected,
        }),
        InputValue::List(items) => {
            let inner = match expected.as_ref().map(TypeRef::nullable) {
                Some(TypeRef::List(inner)) => Some((**inner).clone()),
                _ => None,
            };
            for item in items {
                collect_usages(item, inner.clone(), field, argument, out);
            }
        }
        InputValue::Object(fields) => {
            for (_, v) in fields {
                collect_usages(v, None, field, argument, out);
            }
        }
        _ => {}
    }
}

// ── Fields ──

fn plan_root(
    id: usize,
    sel: &Selection,
    package: &ApiPackage,
    variables: &HashMap<String, Value>,
) -> Result<PlanStep, PlanError> {
    let schema = &package.schema;
    let def = schema
        .query_field(&sel.name)
        .ok_or_else(|| PlanError::UnknownField {
            type_name: QUERY_ROOT.to_string(),
            field: sel.name.clone(),
        })?;
    let module = package
        .module_ref(&sel.name, def)
        .ok_or_else(|| PlanError::UnboundField(sel.name.clone()))?;

    let arguments = plan_arguments(sel, def, schema, variables)?;
    let projection = project(schema, &def.type_ref, &sel.selections, sel.response_key())?;

    Ok(PlanStep {
        id,
        key: sel.response_key().to_string(),
        field: sel.name.clone(),
        module,
        arguments,
        depends_on: Vec::new(),
        result_type: def.type_ref.clone(),
        projection,
    })
}

fn plan_arguments(
    sel: &Selection,
    def: &FieldDef,
    schema: &ApiSchema,
    variables: &HashMap<String, Value>,
) -> Result<Vec<PlanArgument>, PlanError> {
    let mut out = Vec::with_capacity(def.args.len());

    for arg in &sel.arguments {
        let arg_def = def.arg(&arg.name).ok_or_else(|| PlanError::UnknownArgument {
            field: sel.name.clone(),
            argument: arg.name.clone(),
        })?;
        check_input(schema, &arg.value, &arg_def.type_ref).map_err(|found| {
            PlanError::ArgumentType {
                field: sel.name.clone(),
                argument: arg.name.clone(),
                expected: arg_def.type_ref.to_string(),
                found,
            }
        })?;

        let value = lower(&arg.value, variables);
        if value.as_const().is_some_and(Value::is_null) {
            match &arg_def.default {
                // An unset optional variable falls back to the argument default.
                Some(default) if matches!(arg.value, InputValue::Variable(_)) => {
                    out.push(PlanArgument {
                        name: arg.name.clone(),
                        value: ArgumentValue::Const(default.clone()),
                    });
                    continue;
                }
                _ if arg_def.type_ref.is_non_null() => {
                    return Err(PlanError::MissingArgument {
                        field: sel.name.clone(),
                        argument: arg.name.clone(),
                    });
                }
                _ => {}
            }
        }
        out.push(PlanArgument {
            name: arg.name.clone(),
            value,
        });
    }

    for arg_def in &def.args {
        if sel.arguments.iter().any(|a| a.name == arg_def.name) {
            continue;
        }
        match &arg_def.default {
            Some(default) => out.push(PlanArgument {
                name: arg_def.name.clone(),
                value: ArgumentValue::Const(default.clone()),
            }),
            None if arg_def.type_ref.is_non_null() => {
                return Err(PlanError::MissingArgument {
                    field: sel.name.clone(),
                    argument: arg_def.name.clone(),
                });
            }
            None => {}
        }
    }

    Ok(out)
}

/// Check a literal against an input type. Variables and sibling references
/// are checked elsewhere. Returns the offending kind on mismatch.
fn check_input(schema: &ApiSchema, value: &InputValue, ty: &TypeRef) -> Result<(), String> {
    if matches!(value, InputValue::Variable(_) | InputValue::Sibling(_)) {
        return Ok(());
    }
    match ty {
        TypeRef::NonNull(inner) => match value {
            InputValue::Null => Err("null".to_string()),
            _ => check_input(schema, value, inner),
        },
        _ if matches!(value, InputValue::Null) => Ok(()),
        TypeRef::List(inner) => match value {
            InputValue::List(items) => items.iter().try_for_each(|i| check_input(schema, i, inner)),
            other => Err(describe_input(other).to_string()),
        },
        TypeRef::Named(name) if name == "JSON" => Ok(()),
        TypeRef::Named(name) => match (schema.object_type(name), value) {
            (Some(object), InputValue::Object(fields)) => {
                for (key, v) in fields {
                    let field = object
                        .fields
                        .get(key)
                        .ok_or_else(|| format!("object with unknown field '{key}'"))?;
                    check_input(schema, v, &field.type_ref)?;
                }
                match object
                    .fields
                    .iter()
                    .find(|(k, f)| f.type_ref.is_non_null() && !fields.iter().any(|(n, _)| n == *k))
                {
                    Some((k, _)) => Err(format!("object missing field '{k}'")),
                    None => Ok(()),
                }
            }
            (Some(_), other) => Err(describe_input(other).to_string()),
            (None, other) => match other.to_const() {
                Some(v) if schema.value_matches(&v, ty) => Ok(()),
                _ => Err(describe_input(other).to_string()),
            },
        },
    }
}

fn describe_input(value: &InputValue) -> &'static str {
    match value {
        InputValue::Null => "null",
        InputValue::Boolean(_) => "boolean",
        InputValue::Int(_) => "integer",
        InputValue::Float(_) => "float",
        InputValue::String(_) => "string",
        InputValue::List(_) => "list",
        InputValue::Object(_) => "object",
        InputValue::Variable(_) => "variable",
        InputValue::Sibling(_) => "sibling reference",
    }
}

/// Substitute variables; collapse fully constant lists and objects.
fn lower(value: &InputValue, variables: &HashMap<String, Value>) -> ArgumentValue {
    match value {
        InputValue::Variable(name) => {
            ArgumentValue::Const(variables.get(name).cloned().unwrap_or(Value::Null))
        }
        InputValue::Sibling(key) => ArgumentValue::Sibling(key.clone()),
        InputValue::List(items) => {
            let items: Vec<ArgumentValue> = items.iter().map(|i| lower(i, variables)).collect();
            if items.iter().all(|i| i.as_const().is_some()) {
                ArgumentValue::Const(Value::Array(
                    items.into_iter().filter_map(ArgumentValue::into_const).collect(),
                ))
            } else {
                ArgumentValue::List(items)
            }
        }
        InputValue::Object(fields) => {
            let fields: Vec<(String, ArgumentValue)> = fields
                .iter()
                .map(|(k, v)| (k.clone(), lower(v, variables)))
                .collect();
            if fields.iter().all(|(_, v)| v.as_const().is_some()) {
                ArgumentValue::Const(Value::Object(
                    fields
                        .into_iter()
                        .filter_map(|(k, v)| v.into_const().map(|c| (k, c)))
                        .collect(),
                ))
            } else {
                ArgumentValue::Object(fields)
            }
        }
        literal => ArgumentValue::Const(literal.to_const().unwrap_or(Value::Null)),
    }
}

fn project(
    schema: &ApiSchema,
    ty: &TypeRef,
    selections: &[Selection],
    path: &str,
) -> Result<Option<Projection>, PlanError> {
    let base = ty.base_name();
    let Some(object) = schema.object_type(base) else {
        if !selections.is_empty() {
            return Err(PlanError::InvalidSelection {
                path: path.to_string(),
                reason: format!("scalar type {base} cannot have a sub-selection"),
            });
        }
        return Ok(None);
    };

    if selections.is_empty() {
        return Err(PlanError::InvalidSelection {
            path: path.to_string(),
            reason: format!("object type {base} needs a sub-selection"),
        });
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(selections.len());
    for sel in selections {
        let key = sel.response_key();
        let child_path = format!("{path}.{key}");
        if !seen.insert(key) {
            return Err(PlanError::DuplicateResponseKey(child_path));
        }
        if !sel.arguments.is_empty() {
            return Err(PlanError::InvalidSelection {
                path: child_path,
                reason: "arguments are only allowed on root fields".to_string(),
            });
        }
        let def = object.fields.get(&sel.name).ok_or_else(|| PlanError::UnknownField {
            type_name: base.to_string(),
            field: sel.name.clone(),
        })?;
        fields.push(ProjectedField {
            key: key.to_string(),
            name: sel.name.clone(),
            type_ref: def.type_ref.clone(),
            projection: project(schema, &def.type_ref, &sel.selections, &child_path)?,
        });
    }
    Ok(Some(Projection { fields }))
}

// ── Ordering ──

/// Topological order over `refs` (step -> steps it references), breaking
/// ties by document position. Fails with the first cycle found.
fn order_steps(refs: &[Vec<usize>], keys: &[String]) -> Result<Vec<usize>, PlanError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(refs.len(), 0);
    let nodes: Vec<NodeIndex> = (0..refs.len()).map(|i| graph.add_node(i)).collect();
    for (from, deps) in refs.iter().enumerate() {
        for &to in deps {
            graph.add_edge(nodes[from], nodes[to], ());
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(PlanError::PlanCycle(name_cycle(&graph, refs, keys)));
    }

    // Kahn's algorithm; a step is ready once everything it references is placed.
    let mut remaining: Vec<usize> = refs.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); refs.len()];
    for (step, deps) in refs.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(step);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = remaining
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(refs.len());
    while let Some(Reverse(step)) = ready.pop() {
        order.push(step);
        for &next in &dependents[step] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    Ok(order)
}

/// Name a cycle starting at the earliest step that sits on one.
fn name_cycle(graph: &DiGraph<usize, ()>, refs: &[Vec<usize>], keys: &[String]) -> Vec<String> {
    let on_cycle = |scc: &Vec<NodeIndex>| {
        scc.len() > 1 || refs[graph[scc[0]]].contains(&graph[scc[0]])
    };
    let Some(component) = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| on_cycle(scc))
        .map(|scc| scc.into_iter().map(|n| graph[n]).collect::<HashSet<usize>>())
        .min_by_key(|scc| scc.iter().min().copied())
    else {
        return Vec::new();
    };
    let Some(start) = component.iter().min().copied() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut visited = HashSet::from([start]);
    walk_cycle(start, start, refs, &component, &mut visited, &mut path);
    path.push(start);
    path.into_iter().map(|i| keys[i].clone()).collect()
}

/// Depth-first search for an edge back to `start`, following references in
/// document order. Leaves the cycle in `path` when found.
fn walk_cycle(
    node: usize,
    start: usize,
    refs: &[Vec<usize>],
    component: &HashSet<usize>,
    visited: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> bool {
    for &next in &refs[node] {
        if next == start {
            return true;
        }
        if component.contains(&next) && visited.insert(next) {
            path.push(next);
            if walk_cycle(next, start, refs, component, visited, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}
