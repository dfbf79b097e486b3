//! Query parser: recursive descent over a GraphQL subset.
//!
//! Grammar:
//! ```text
//! document     := [ 'query' [Name] [varDefs] ] selectionSet
//! varDefs      := '(' varDef+ ')'
//! varDef       := '$' Name ':' type [ '=' value ]
//! type         := ( Name | '[' type ']' ) [ '!' ]
//! selectionSet := '{' selection+ '}'
//! selection    := [Name ':'] Name [ '(' (Name ':' value)+ ')' ] [selectionSet]
//! value        := '$' Name | '@' Name | Int | Float | String
//!               | 'true' | 'false' | 'null' | '[' value* ']' | '{' (Name ':' value)* '}'
//! ```
//!
//! Commas are insignificant and `#` starts a comment. `@name` is a sibling
//! reference: the argument receives the result of the root selection whose
//! response key is `name`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MAX_NESTING_DEPTH;
use crate::error::ParseError;
use crate::schema::TypeRef;

/// A parsed query. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDocument {
    /// Operation name, if given.
    pub name: Option<String>,
    /// Declared variables.
    pub variables: Vec<VariableDefinition>,
    /// Root selections, in document order.
    pub selections: Vec<Selection>,
}

impl QueryDocument {
    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables.iter().find(|v| v.name == name)
    }
}

impl FromStr for QueryDocument {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// `$name: Type = default`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    pub type_ref: TypeRef,
    pub default: Option<InputValue>,
}

/// A selected field with optional alias, arguments and sub-selections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<Argument>,
    pub selections: Vec<Selection>,
}

impl Selection {
    /// Key this selection's value appears under in the result.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// `name: value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: InputValue,
}

/// A literal or reference in argument position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputValue {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<InputValue>),
    Object(Vec<(String, InputValue)>),
    Variable(String),
    Sibling(String),
}

impl InputValue {
    /// JSON form, if the value contains no variables or sibling references.
    pub fn to_const(&self) -> Option<Value> {
        Some(match self {
            InputValue::Null => Value::Null,
            InputValue::Boolean(b) => Value::Bool(*b),
            InputValue::Int(i) => Value::from(*i),
            InputValue::Float(f) => Value::from(*f),
            InputValue::String(s) => Value::String(s.clone()),
            InputValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(InputValue::to_const)
                    .collect::<Option<Vec<_>>>()?,
            ),
            InputValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| v.to_const().map(|v| (k.clone(), v)))
                    .collect::<Option<serde_json::Map<_, _>>>()?,
            ),
            InputValue::Variable(_) | InputValue::Sibling(_) => return None,
        })
    }

    /// Sibling keys referenced anywhere inside this value.
    pub fn siblings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.walk(&mut |v| {
            if let InputValue::Sibling(name) = v {
                out.push(name.as_str());
            }
        });
        out
    }

    fn walk<'a>(&'a self, f: &mut impl FnMut(&'a InputValue)) {
        f(self);
        match self {
            InputValue::List(items) => items.iter().for_each(|i| i.walk(f)),
            InputValue::Object(fields) => fields.iter().for_each(|(_, v)| v.walk(f)),
            _ => {}
        }
    }
}

/// Token for the parser.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Int(i64),
    Float(f64),
    StringLit(String),
    Punct(char), // { } ( ) [ ] : = ! $ @
    Eof,
}

/// A token and the character offset it starts at.
type Spanned = (Token, usize);

/// Parse query source text into a [`QueryDocument`].
pub fn parse(source: &str) -> Result<QueryDocument, ParseError> {
    let tokens = tokenize(source)?;
    let mut pos = 0;

    let mut name = None;
    let mut variables = Vec::new();

    if matches!(&tokens[pos].0, Token::Name(n) if n == "query") {
        pos += 1;
        if let Token::Name(n) = &tokens[pos].0 {
            name = Some(n.clone());
            pos += 1;
        }
        if peek_punct(&tokens, pos, '(') {
            pos += 1;
            variables = parse_variable_definitions(&tokens, &mut pos)?;
        }
    }

    let selections = parse_selection_set(&tokens, &mut pos, 0)?;

    match &tokens[pos] {
        (Token::Eof, _) => {}
        (other, at) => return Err(ParseError::new(*at, format!("unexpected {other:?} after query"))),
    }

    Ok(QueryDocument {
        name,
        variables,
        selections,
    })
}

// ── Tokenizer ──

fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // Whitespace and insignificant commas
        if c.is_whitespace() || c == ',' || c == '\u{feff}' {
            i += 1;
            continue;
        }

        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '"' {
            let start = i;
            let (s, next) = lex_string(&chars, i)?;
            tokens.push((Token::StringLit(s), start));
            i = next;
            continue;
        }

        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            i += 1;
            let mut is_float = false;
            while i < chars.len() {
                match chars[i] {
                    d if d.is_ascii_digit() => i += 1,
                    '.' if !is_float => {
                        is_float = true;
                        i += 1;
                    }
                    'e' | 'E' => {
                        is_float = true;
                        i += 1;
                        if matches!(chars.get(i), Some('+') | Some('-')) {
                            i += 1;
                        }
                    }
                    _ => break,
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                text.parse::<f64>()
                    .map(Token::Float)
                    .map_err(|_| ParseError::new(start, format!("invalid number: {text}")))?
            } else {
                text.parse::<i64>()
                    .map(Token::Int)
                    .map_err(|_| ParseError::new(start, format!("integer out of range: {text}")))?
            };
            tokens.push((token, start));
            continue;
        }

        if matches!(c, '{' | '}' | '(' | ')' | '[' | ']' | ':' | '=' | '!' | '$' | '@') {
            tokens.push((Token::Punct(c), i));
            i += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((Token::Name(chars[start..i].iter().collect()), start));
            continue;
        }

        return Err(ParseError::new(i, format!("unexpected character '{c}'")));
    }

    tokens.push((Token::Eof, chars.len()));
    Ok(tokens)
}

/// Lex a double-quoted string starting at `start`; returns the value and the
/// index after the closing quote.
fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), ParseError> {
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None | Some('\n') => {
                return Err(ParseError::new(start, "unterminated string literal"));
            }
            Some('"') => return Ok((out, i + 1)),
            Some('\\') => {
                let escaped = match chars.get(i + 1) {
                    Some('"') => '"',
                    Some('\\') => '\\',
                    Some('/') => '/',
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some('b') => '\u{8}',
                    Some('f') => '\u{c}',
                    Some('u') => {
                        let hex: String = chars.get(i + 2..i + 6).unwrap_or_default().iter().collect();
                        let ch = u32::from_str_radix(&hex, 16)
                            .ok()
                            .filter(|_| hex.len() == 4)
                            .and_then(char::from_u32)
                            .ok_or_else(|| ParseError::new(i, format!("invalid unicode escape \\u{hex}")))?;
                        out.push(ch);
                        i += 6;
                        continue;
                    }
                    other => {
                        return Err(ParseError::new(i, format!("invalid escape {other:?}")));
                    }
                };
                out.push(escaped);
                i += 2;
            }
            Some(c) => {
                out.push(*c);
                i += 1;
            }
        }
    }
}

// ── Parser helpers ──

/// One level deeper, or an error once `MAX_NESTING_DEPTH` is passed.
fn descend(depth: usize, at: usize) -> Result<usize, ParseError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(ParseError::new(at, "nesting too deep"));
    }
    Ok(depth + 1)
}

fn peek_punct(tokens: &[Spanned], pos: usize, c: char) -> bool {
    matches!(tokens.get(pos), Some((Token::Punct(p), _)) if *p == c)
}

fn expect_punct(tokens: &[Spanned], pos: &mut usize, c: char) -> Result<(), ParseError> {
    match &tokens[*pos] {
        (Token::Punct(p), _) if *p == c => {
            *pos += 1;
            Ok(())
        }
        (other, at) => Err(ParseError::new(*at, format!("expected '{c}', found {other:?}"))),
    }
}

fn expect_name(tokens: &[Spanned], pos: &mut usize, what: &str) -> Result<String, ParseError> {
    match &tokens[*pos] {
        (Token::Name(n), _) => {
            *pos += 1;
            Ok(n.clone())
        }
        (other, at) => Err(ParseError::new(*at, format!("expected {what}, found {other:?}"))),
    }
}

fn parse_variable_definitions(
    tokens: &[Spanned],
    pos: &mut usize,
) -> Result<Vec<VariableDefinition>, ParseError> {
    let mut defs: Vec<VariableDefinition> = Vec::new();
    loop {
        let at = tokens[*pos].1;
        expect_punct(tokens, pos, '$')?;
        let name = expect_name(tokens, pos, "variable name")?;
        expect_punct(tokens, pos, ':')?;
        let type_ref = parse_type(tokens, pos, 0)?;

        let default = if peek_punct(tokens, *pos, '=') {
            *pos += 1;
            let value_at = tokens[*pos].1;
            let value = parse_value(tokens, pos, 0)?;
            if value.to_const().is_none() {
                return Err(ParseError::new(value_at, "default values must be constant"));
            }
            Some(value)
        } else {
            None
        };

        if defs.iter().any(|d| d.name == name) {
            return Err(ParseError::new(at, format!("variable ${name} declared twice")));
        }
        defs.push(VariableDefinition {
            name,
            type_ref,
            default,
        });

        if peek_punct(tokens, *pos, ')') {
            *pos += 1;
            return Ok(defs);
        }
    }
}

fn parse_type(tokens: &[Spanned], pos: &mut usize, depth: usize) -> Result<TypeRef, ParseError> {
    let inner = if peek_punct(tokens, *pos, '[') {
        let depth = descend(depth, tokens[*pos].1)?;
        *pos += 1;
        let inner = parse_type(tokens, pos, depth)?;
        expect_punct(tokens, pos, ']')?;
        TypeRef::list(inner)
    } else {
        TypeRef::Named(expect_name(tokens, pos, "type name")?)
    };

    if peek_punct(tokens, *pos, '!') {
        *pos += 1;
        return Ok(TypeRef::non_null(inner));
    }
    Ok(inner)
}

fn parse_selection_set(
    tokens: &[Spanned],
    pos: &mut usize,
    depth: usize,
) -> Result<Vec<Selection>, ParseError> {
    let depth = descend(depth, tokens[*pos].1)?;
    expect_punct(tokens, pos, '{')?;
    let mut selections = Vec::new();
    while !peek_punct(tokens, *pos, '}') {
        selections.push(parse_selection(tokens, pos, depth)?);
    }
    if selections.is_empty() {
        return Err(ParseError::new(tokens[*pos].1, "empty selection set"));
    }
    *pos += 1; // consume '}'
    Ok(selections)
}

fn parse_selection(tokens: &[Spanned], pos: &mut usize, depth: usize) -> Result<Selection, ParseError> {
    let first = expect_name(tokens, pos, "field name")?;

    let (alias, name) = if peek_punct(tokens, *pos, ':') {
        *pos += 1;
        (Some(first), expect_name(tokens, pos, "field name after alias")?)
    } else {
        (None, first)
    };

    let mut arguments: Vec<Argument> = Vec::new();
    if peek_punct(tokens, *pos, '(') {
        *pos += 1;
        loop {
            let at = tokens[*pos].1;
            let arg_name = expect_name(tokens, pos, "argument name")?;
            expect_punct(tokens, pos, ':')?;
            let value = parse_value(tokens, pos, depth)?;
            if arguments.iter().any(|a| a.name == arg_name) {
                return Err(ParseError::new(at, format!("argument '{arg_name}' given twice")));
            }
            arguments.push(Argument {
                name: arg_name,
                value,
            });
            if peek_punct(tokens, *pos, ')') {
                *pos += 1;
                break;
            }
        }
    }

    let selections = if peek_punct(tokens, *pos, '{') {
        parse_selection_set(tokens, pos, depth)?
    } else {
        Vec::new()
    };

    Ok(Selection {
        alias,
        name,
        arguments,
        selections,
    })
}

fn parse_value(tokens: &[Spanned], pos: &mut usize, depth: usize) -> Result<InputValue, ParseError> {
    let (token, at) = &tokens[*pos];
    *pos += 1;
    match token {
        Token::Punct('$') => Ok(InputValue::Variable(expect_name(tokens, pos, "variable name")?)),
        Token::Punct('@') => Ok(InputValue::Sibling(expect_name(tokens, pos, "sibling field key")?)),
        Token::Int(i) => Ok(InputValue::Int(*i)),
        Token::Float(f) => Ok(InputValue::Float(*f)),
        Token::StringLit(s) => Ok(InputValue::String(s.clone())),
        Token::Name(n) => match n.as_str() {
            "true" => Ok(InputValue::Boolean(true)),
            "false" => Ok(InputValue::Boolean(false)),
            "null" => Ok(InputValue::Null),
            other => Err(ParseError::new(*at, format!("unexpected name '{other}' in value position"))),
        },
        Token::Punct('[') => {
            let depth = descend(depth, *at)?;
            let mut items = Vec::new();
            while !peek_punct(tokens, *pos, ']') {
                if matches!(tokens[*pos].0, Token::Eof) {
                    return Err(ParseError::new(*at, "unterminated list"));
                }
                items.push(parse_value(tokens, pos, depth)?);
            }
            *pos += 1;
            Ok(InputValue::List(items))
        }
        Token::Punct('{') => {
            let depth = descend(depth, *at)?;
            let mut fields: Vec<(String, InputValue)> = Vec::new();
            while !peek_punct(tokens, *pos, '}') {
                let key = expect_name(tokens, pos, "object field name")?;
                expect_punct(tokens, pos, ':')?;
                let value = parse_value(tokens, pos, depth)?;
                fields.push((key, value));
            }
            *pos += 1;
            Ok(InputValue::Object(fields))
        }
        other => Err(ParseError::new(*at, format!("expected value, found {other:?}"))),
    }
}
