//! Query & Template Runtime (C1).
//!
//! The path-query language and the text-template language are external
//! collaborators at the spec's boundary: both are exposed behind traits
//! ([`QueryEngine`], [`TemplateEngine`]) so a host can plug in a real
//! external jq-like engine. This module ships the default implementation of
//! each, covering exactly the subset exercised by the rest of the crate:
//! identity (`.`), field/index/wildcard access, `$res`/`$ctx`/`$new`
//! variable references, and the `<path> = <expr>` / `<path> += <expr>`
//! assignment forms used by merges.
//!
//! This generalizes the path navigation the source project hand-rolled in
//! `extractors::navigate_json_multi` into a small compiled-AST form so
//! expressions are parsed once (at plan compile time) instead of on every
//! evaluation.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// One segment of a dotted/bracketed path: `.field`, `[N]`, or `[*]`.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    Wildcard,
}

/// A parsed (but not yet bound) expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `.` with no further segments.
    Identity,
    /// `.field.sub[0]` — applied to the implicit input.
    Path(Vec<PathSegment>),
    /// `$name.field.sub` — applied to a bound runtime variable.
    Var(String, Vec<PathSegment>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Append,
}

/// A compiled query program. Either a plain query expression (for `Run` /
/// `RunSingle` / `RunArray`) or an assignment used by merge rules.
/// `NoOp` is the sentinel produced by compiling empty source text, distinct
/// from a successful compilation of `.`.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledQuery {
    NoOp,
    Query(Expr),
    Assign {
        target: Vec<PathSegment>,
        op: AssignOp,
        rhs: Expr,
    },
}

#[derive(Debug, Clone)]
pub struct QueryError {
    pub expression: String,
    pub message: String,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`: {}", self.expression, self.message)
    }
}

impl std::error::Error for QueryError {}

fn err(expression: &str, message: impl Into<String>) -> QueryError {
    QueryError {
        expression: expression.to_string(),
        message: message.into(),
    }
}

/// Splits a dotted/bracketed path like `items[0].name` or `.items[*].id`
/// into segments, the same way the source project's `extractors::split_path`
/// did for its hand-rolled JSONPath walker.
fn parse_path(raw: &str) -> Result<Vec<PathSegment>, String> {
    let raw = raw.trim().trim_start_matches('.');
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();

    let flush = |current: &mut String, segments: &mut Vec<PathSegment>| {
        if !current.is_empty() {
            segments.push(PathSegment::Field(std::mem::take(current)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut current, &mut segments),
            '[' => {
                flush(&mut current, &mut segments);
                let mut bracket = String::new();
                for c2 in chars.by_ref() {
                    if c2 == ']' {
                        break;
                    }
                    bracket.push(c2);
                }
                if bracket == "*" {
                    segments.push(PathSegment::Wildcard);
                } else {
                    let idx: usize = bracket
                        .parse()
                        .map_err(|_| format!("invalid index `[{bracket}]`"))?;
                    segments.push(PathSegment::Index(idx));
                }
            }
            other => current.push(other),
        }
    }
    flush(&mut current, &mut segments);
    Ok(segments)
}

fn parse_expr(raw: &str, vars: &[String]) -> Result<Expr, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "." {
        return Ok(Expr::Identity);
    }
    if let Some(rest) = raw.strip_prefix('$') {
        let mut chars = rest.char_indices();
        let end = chars
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let name = &rest[..end];
        if !vars.iter().any(|v| v == name) {
            return Err(format!("unbound variable `${name}`"));
        }
        let segments = parse_path(&rest[end..])?;
        return Ok(Expr::Var(name.to_string(), segments));
    }
    Ok(Expr::Path(parse_path(raw)?))
}

/// Finds the top-level ` = ` or ` += ` operator of an assignment, ignoring
/// occurrences inside `[...]` brackets.
fn find_assign_op(raw: &str) -> Option<(usize, AssignOp, usize)> {
    let bytes = raw.as_bytes();
    let mut depth = 0i32;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth -= 1,
            b'+' if depth == 0 && bytes.get(i + 1) == Some(&b'=') => {
                return Some((i, AssignOp::Append, i + 2));
            }
            b'=' if depth == 0 && bytes.get(i.wrapping_sub(1)) != Some(&b'!') => {
                return Some((i, AssignOp::Set, i + 1));
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Compiles source text into a [`CompiledQuery`]. `vars` lists the variable
/// names that may legally appear bound (e.g. `["res", "ctx"]`). Compilation
/// is pure: the same source and variable list always compile to an equal
/// program.
pub fn compile(source: &str, vars: &[String]) -> Result<CompiledQuery, QueryError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Ok(CompiledQuery::NoOp);
    }
    if let Some((split, op, after)) = find_assign_op(trimmed) {
        let lhs = &trimmed[..split];
        let rhs = &trimmed[after..];
        let target = parse_path(lhs).map_err(|m| err(source, m))?;
        let rhs_expr = parse_expr(rhs, vars).map_err(|m| err(source, m))?;
        return Ok(CompiledQuery::Assign {
            target,
            op,
            rhs: rhs_expr,
        });
    }
    let expr = parse_expr(trimmed, vars).map_err(|m| err(source, m))?;
    Ok(CompiledQuery::Query(expr))
}

fn access<'a>(values: Vec<Value>, seg: &PathSegment) -> Vec<Value> {
    values
        .into_iter()
        .flat_map(|v| -> Vec<Value> {
            match (seg, v) {
                (PathSegment::Field(name), Value::Object(map)) => {
                    map.get(name).cloned().into_iter().collect()
                }
                (PathSegment::Index(idx), Value::Array(arr)) => {
                    arr.get(*idx).cloned().into_iter().collect()
                }
                (PathSegment::Wildcard, Value::Array(arr)) => arr,
                (PathSegment::Wildcard, Value::Object(map)) => map.into_values().collect(),
                _ => Vec::new(),
            }
        })
        .collect()
}

fn eval_path(segments: &[PathSegment], base: &Value) -> Vec<Value> {
    let mut values = vec![base.clone()];
    for seg in segments {
        values = access(values, seg);
    }
    values
}

fn eval_expr(expr: &Expr, input: &Value, vars: &HashMap<String, Value>) -> Result<Vec<Value>, String> {
    match expr {
        Expr::Identity => Ok(vec![input.clone()]),
        Expr::Path(segments) => Ok(eval_path(segments, input)),
        Expr::Var(name, segments) => {
            let base = vars
                .get(name)
                .ok_or_else(|| format!("unbound variable `${name}` at evaluation time"))?;
            Ok(eval_path(segments, base))
        }
    }
}

fn set_path(root: &mut Value, segments: &[PathSegment], value: Value, op: AssignOp) -> Result<(), String> {
    if segments.is_empty() {
        *root = merge_assign(root.clone(), value, op);
        return Ok(());
    }
    let (head, rest) = segments.split_first().unwrap();
    match head {
        PathSegment::Field(name) => {
            if !root.is_object() {
                *root = Value::Object(serde_json::Map::new());
            }
            let map = root.as_object_mut().unwrap();
            let entry = map.entry(name.clone()).or_insert(Value::Null);
            set_path(entry, rest, value, op)
        }
        PathSegment::Index(idx) => {
            if !root.is_array() {
                *root = Value::Array(Vec::new());
            }
            let arr = root.as_array_mut().unwrap();
            while arr.len() <= *idx {
                arr.push(Value::Null);
            }
            set_path(&mut arr[*idx], rest, value, op)
        }
        PathSegment::Wildcard => Err("wildcard is not a valid assignment target".to_string()),
    }
}

/// Default merge-by-kind: sequence+sequence → append; mapping+mapping →
/// shallow overwrite; anything else → replace. `Append` requests the
/// concatenating behavior explicitly (`+=`); `Set` always replaces.
fn merge_assign(current: Value, incoming: Value, op: AssignOp) -> Value {
    match op {
        AssignOp::Set => incoming,
        AssignOp::Append => default_merge(current, incoming),
    }
}

/// The shared default-merge-by-kind rule, used both by `+=` assignment and
/// by the Step Executor's merge dispatch when no compiled rule is present.
pub fn default_merge(current: Value, incoming: Value) -> Value {
    match (current, incoming) {
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (Value::Object(mut a), Value::Object(b)) => {
            for (k, v) in b {
                a.insert(k, v);
            }
            Value::Object(a)
        }
        (_, incoming) => incoming,
    }
}

/// Run mode: collect all outputs; return the single output if exactly one,
/// the sequence otherwise.
pub fn run(program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError> {
    match program {
        CompiledQuery::NoOp => Ok(input.clone()),
        CompiledQuery::Query(expr) => {
            let outputs = eval_expr(expr, input, vars).map_err(|m| err("", m))?;
            Ok(match outputs.len() {
                1 => outputs.into_iter().next().unwrap(),
                _ => Value::Array(outputs),
            })
        }
        CompiledQuery::Assign { target, op, rhs } => {
            let rhs_values = eval_expr(rhs, input, vars).map_err(|m| err("", m))?;
            let rhs_value = single(rhs_values)?;
            let mut result = input.clone();
            set_path(&mut result, target, rhs_value, *op).map_err(|m| err("", m))?;
            Ok(result)
        }
    }
}

/// RunSingle mode: fails with a multi-result error if more than one output,
/// returns `Value::Null` for zero outputs.
pub fn run_single(program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError> {
    match program {
        CompiledQuery::NoOp => Ok(input.clone()),
        CompiledQuery::Query(expr) => {
            let outputs = eval_expr(expr, input, vars).map_err(|m| err("", m))?;
            match outputs.len() {
                0 => Ok(Value::Null),
                1 => Ok(outputs.into_iter().next().unwrap()),
                _ => Err(err("", "expression produced more than one result")),
            }
        }
        CompiledQuery::Assign { .. } => run(program, input, vars),
    }
}

/// RunArray mode: returns all outputs as a sequence; if exactly one output
/// which is itself a sequence, that sequence is returned unwrapped.
pub fn run_array(program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError> {
    match program {
        CompiledQuery::NoOp => Ok(input.clone()),
        CompiledQuery::Query(expr) => {
            let outputs = eval_expr(expr, input, vars).map_err(|m| err("", m))?;
            if outputs.len() == 1 {
                if let Value::Array(_) = &outputs[0] {
                    return Ok(outputs.into_iter().next().unwrap());
                }
            }
            Ok(Value::Array(outputs))
        }
        CompiledQuery::Assign { .. } => run(program, input, vars),
    }
}

fn single(values: Vec<Value>) -> Result<Value, QueryError> {
    match values.len() {
        1 => Ok(values.into_iter().next().unwrap()),
        0 => Ok(Value::Null),
        _ => Err(err("", "right-hand side produced more than one result")),
    }
}

// ============================================================================
// Templates
// ============================================================================

use once_cell::sync::Lazy;
use regex::Regex;

static TEMPLATE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}\}").unwrap());

/// A compiled text template: the literal source plus whether it actually
/// contains any `{{ .ident }}` markers (a template with none is preserved as
/// a literal value by the plan compiler rather than re-rendered per call).
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    source: String,
    idents: Vec<String>,
}

impl CompiledTemplate {
    pub fn has_markers(&self) -> bool {
        !self.idents.is_empty()
    }

    /// Top-level identifiers referenced — used by the compiler for
    /// selective-context planning.
    pub fn referenced_idents(&self) -> &[String] {
        &self.idents
    }
}

/// Compiles template source. Always succeeds: the grammar (`{{ .ident }}`)
/// degenerates gracefully to "no markers" for any text without a match.
pub fn compile_template(source: &str) -> CompiledTemplate {
    let idents = TEMPLATE_MARKER
        .captures_iter(source)
        .map(|c| c[1].split('.').next().unwrap().to_string())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    CompiledTemplate {
        source: source.to_string(),
        idents,
    }
}

fn value_to_template_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Renders a compiled template against a mapping-valued view.
pub fn render_template(tpl: &CompiledTemplate, view: &Value) -> String {
    TEMPLATE_MARKER
        .replace_all(&tpl.source, |caps: &regex::Captures| {
            let path = parse_path(&caps[1]).unwrap_or_default();
            let results = eval_path(&path, view);
            results
                .first()
                .map(value_to_template_string)
                .unwrap_or_default()
        })
        .into_owned()
}

// ============================================================================
// Collaborator boundary
// ============================================================================

/// The path-query engine as an external collaborator. A host embedding this
/// crate may substitute a real jq-like engine by implementing this trait;
/// [`DefaultEngine`] is the bundled implementation used unless a host swaps
/// it in.
pub trait QueryEngine: Send + Sync {
    fn compile(&self, source: &str, vars: &[String]) -> Result<CompiledQuery, QueryError>;
    fn run(&self, program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError>;
    fn run_single(&self, program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError>;
    fn run_array(&self, program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError>;
}

/// The text-template engine as an external collaborator, analogous to
/// [`QueryEngine`].
pub trait TemplateEngine: Send + Sync {
    fn compile(&self, source: &str) -> CompiledTemplate;
    fn render(&self, tpl: &CompiledTemplate, view: &Value) -> String;
}

/// The bundled default implementation of both collaborator traits.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEngine;

impl QueryEngine for DefaultEngine {
    fn compile(&self, source: &str, vars: &[String]) -> Result<CompiledQuery, QueryError> {
        compile(source, vars)
    }
    fn run(&self, program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError> {
        run(program, input, vars)
    }
    fn run_single(&self, program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError> {
        run_single(program, input, vars)
    }
    fn run_array(&self, program: &CompiledQuery, input: &Value, vars: &HashMap<String, Value>) -> Result<Value, QueryError> {
        run_array(program, input, vars)
    }
}

impl TemplateEngine for DefaultEngine {
    fn compile(&self, source: &str) -> CompiledTemplate {
        compile_template(source)
    }
    fn render(&self, tpl: &CompiledTemplate, view: &Value) -> String {
        render_template(tpl, view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn compiles_empty_source_to_noop() {
        assert_eq!(compile("", &[]).unwrap(), CompiledQuery::NoOp);
        assert_eq!(compile("   ", &[]).unwrap(), CompiledQuery::NoOp);
    }

    #[test]
    fn identity_differs_from_noop() {
        let id = compile(".", &[]).unwrap();
        assert_ne!(id, CompiledQuery::NoOp);
        assert_eq!(run(&id, &json!({"a": 1}), &vars(&[])).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn run_single_field() {
        let prog = compile(".items", &[]).unwrap();
        let out = run(&prog, &json!({"items": [1, 2, 3]}), &vars(&[])).unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[test]
    fn run_single_rejects_multiple_results() {
        let prog = compile(".items[*]", &[]).unwrap();
        let res = run_single(&prog, &json!({"items": [1, 2]}), &vars(&[]));
        assert!(res.is_err());
    }

    #[test]
    fn run_single_empty_returns_null() {
        let prog = compile(".missing", &[]).unwrap();
        let out = run_single(&prog, &json!({}), &vars(&[])).unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn run_array_unwraps_single_sequence_output() {
        let prog = compile(".items", &[]).unwrap();
        let out = run_array(&prog, &json!({"items": [1, 2]}), &vars(&[])).unwrap();
        assert_eq!(out, json!([1, 2]));
    }

    #[test]
    fn run_array_wraps_scalar_output() {
        let prog = compile(".id", &[]).unwrap();
        let out = run_array(&prog, &json!({"id": 7}), &vars(&[])).unwrap();
        assert_eq!(out, json!([7]));
    }

    #[test]
    fn assign_append_merges_arrays() {
        let prog = compile(".items += $res.items", &["res".to_string(), "ctx".to_string()]).unwrap();
        let input = json!({"items": [1, 2]});
        let v = vars(&[("res", json!({"items": [3, 4]}))]);
        let out = run(&prog, &input, &v).unwrap();
        assert_eq!(out, json!({"items": [1, 2, 3, 4]}));
    }

    #[test]
    fn synthetic_default_merge_sets_path_from_new() {
        let prog = compile(".items = $new", &["new".to_string()]).unwrap();
        let input = json!({});
        let v = vars(&[("new", json!([1, 2, 3]))]);
        let out = run(&prog, &input, &v).unwrap();
        assert_eq!(out, json!({"items": [1, 2, 3]}));
    }

    #[test]
    fn template_renders_dotted_field_access() {
        let tpl = compile_template("https://x/items/{{ .item }}");
        assert!(tpl.has_markers());
        assert_eq!(tpl.referenced_idents(), &["item".to_string()]);
        let rendered = render_template(&tpl, &json!({"item": 5}));
        assert_eq!(rendered, "https://x/items/5");
    }

    #[test]
    fn template_without_markers_has_no_idents() {
        let tpl = compile_template("https://x/static");
        assert!(!tpl.has_markers());
    }

    #[test]
    fn unbound_variable_fails_to_compile() {
        let err = compile("$nope.field", &["res".to_string()]).unwrap_err();
        assert!(err.message.contains("unbound"));
    }
}
