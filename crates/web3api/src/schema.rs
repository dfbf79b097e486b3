//! API schema model: type references, object types, fields and arguments.
//!
//! Schemas arrive inside a package manifest and are checked once when the
//! package is decoded, so the planner can assume every type name resolves.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::config::MAX_NESTING_DEPTH;

/// Name used for the query root in error messages.
pub const QUERY_ROOT: &str = "Query";

/// Built-in scalar type names.
pub const SCALARS: [&str; 6] = ["Int", "Float", "String", "Boolean", "ID", "JSON"];

/// A GraphQL-style type reference: `Int`, `[String!]`, `Token!`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: &str) -> Self {
        TypeRef::Named(name.to_string())
    }

    pub fn non_null(inner: TypeRef) -> Self {
        TypeRef::NonNull(Box::new(inner))
    }

    pub fn list(inner: TypeRef) -> Self {
        TypeRef::List(Box::new(inner))
    }

    /// Parse the textual form.
    pub fn parse(input: &str) -> Result<Self, String> {
        if input.matches('[').count() > MAX_NESTING_DEPTH {
            return Err(format!("type nested deeper than {MAX_NESTING_DEPTH} lists"));
        }
        Self::parse_nested(input)
    }

    fn parse_nested(input: &str) -> Result<Self, String> {
        let s = input.trim();
        if s.is_empty() {
            return Err("empty type".to_string());
        }
        if let Some(inner) = s.strip_suffix('!') {
            if inner.trim_end().ends_with('!') {
                return Err(format!("doubled '!' in type '{input}'"));
            }
            return Ok(TypeRef::non_null(TypeRef::parse_nested(inner)?));
        }
        if let Some(body) = s.strip_prefix('[') {
            let inner = body
                .strip_suffix(']')
                .ok_or_else(|| format!("unclosed '[' in type '{input}'"))?;
            return Ok(TypeRef::list(TypeRef::parse_nested(inner)?));
        }
        if s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !s.starts_with(|c: char| c.is_ascii_digit())
        {
            return Ok(TypeRef::Named(s.to_string()));
        }
        Err(format!("invalid type '{input}'"))
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    /// The type with an outer `!` removed.
    pub fn nullable(&self) -> &TypeRef {
        match self {
            TypeRef::NonNull(inner) => inner,
            other => other,
        }
    }

    /// Innermost named type.
    pub fn base_name(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.base_name(),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.nullable(), TypeRef::List(_))
    }

    /// Whether a value of type `self` may be passed where `target` is expected.
    pub fn is_assignable_to(&self, target: &TypeRef) -> bool {
        match (self, target) {
            (_, TypeRef::Named(name)) if name == "JSON" => true,
            (TypeRef::NonNull(a), TypeRef::NonNull(b)) => a.is_assignable_to(b),
            (_, TypeRef::NonNull(_)) => false,
            (TypeRef::NonNull(a), b) => a.is_assignable_to(b),
            (TypeRef::List(a), TypeRef::List(b)) => a.is_assignable_to(b),
            (TypeRef::Named(a), TypeRef::Named(b)) => a == b || (a == "Int" && b == "Float"),
            _ => false,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

impl Serialize for TypeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TypeRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TypeRef::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An argument accepted by a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A field on the query root or on an object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgumentDef>,
    /// Name of the package module that resolves this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Function to call inside the module. Defaults to the field name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDef {
    pub fn arg(&self, name: &str) -> Option<&ArgumentDef> {
        self.args.iter().find(|a| a.name == name)
    }
}

/// A named object type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectType {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The schema of an API package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSchema {
    #[serde(default)]
    pub types: BTreeMap<String, ObjectType>,
    /// Root query fields.
    #[serde(default)]
    pub query: BTreeMap<String, FieldDef>,
}

impl ApiSchema {
    pub fn query_field(&self, name: &str) -> Option<&FieldDef> {
        self.query.get(name)
    }

    pub fn object_type(&self, name: &str) -> Option<&ObjectType> {
        self.types.get(name)
    }

    pub fn is_scalar(name: &str) -> bool {
        SCALARS.contains(&name)
    }

    /// Check that every referenced type exists and every module binding
    /// satisfies `has_module`.
    pub fn validate(&self, has_module: impl Fn(&str) -> bool) -> Result<(), String> {
        for name in self.types.keys() {
            if Self::is_scalar(name) {
                return Err(format!("type '{name}' shadows a built-in scalar"));
            }
        }

        let roots = self.query.iter().map(|(f, d)| (QUERY_ROOT, f, d));
        let nested = self
            .types
            .iter()
            .flat_map(|(t, o)| o.fields.iter().map(move |(f, d)| (t.as_str(), f, d)));

        for (owner, field, def) in roots.chain(nested) {
            self.check_type(&def.type_ref)
                .map_err(|e| format!("{owner}.{field}: {e}"))?;
            for arg in &def.args {
                self.check_type(&arg.type_ref)
                    .map_err(|e| format!("{owner}.{field}({}): {e}", arg.name))?;
            }
            if let Some(module) = &def.module {
                if !has_module(module) {
                    return Err(format!("{owner}.{field}: unknown module '{module}'"));
                }
            }
        }
        Ok(())
    }

    fn check_type(&self, ty: &TypeRef) -> Result<(), String> {
        let name = ty.base_name();
        if Self::is_scalar(name) || self.types.contains_key(name) {
            Ok(())
        } else {
            Err(format!("unknown type '{name}'"))
        }
    }

    /// Whether `value` satisfies `ty` under this schema.
    pub fn value_matches(&self, value: &Value, ty: &TypeRef) -> bool {
        match ty {
            TypeRef::NonNull(inner) => !value.is_null() && self.value_matches(value, inner),
            _ if value.is_null() => true,
            TypeRef::List(inner) => match value {
                Value::Array(items) => items.iter().all(|v| self.value_matches(v, inner)),
                _ => false,
            },
            TypeRef::Named(name) => match name.as_str() {
                "JSON" => true,
                "Int" => value.is_i64() || value.is_u64(),
                "Float" => value.is_number(),
                "String" => value.is_string(),
                "Boolean" => value.is_boolean(),
                "ID" => value.is_string() || value.is_i64() || value.is_u64(),
                other => match (self.types.get(other), value) {
                    (Some(object), Value::Object(map)) => object.fields.iter().all(|(k, f)| {
                        self.value_matches(map.get(k).unwrap_or(&Value::Null), &f.type_ref)
                    }),
                    _ => false,
                },
            },
        }
    }
}

/// Short name for the JSON kind of a value, for error messages.
pub fn describe_value(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
