//! Plan compilation (C2, compilation half).
//!
//! Turns an already-[`crate::validate`]d [`Plan`] into a [`CompiledPlan`]: a
//! frozen tree where every `resultTransformer`/`path`/URL/header template has
//! been compiled once via [`crate::query`], so a syntax error in any of them
//! is a compile-time [`CrawlerError::Compilation`] rather than a failure deep
//! into a run. Variable names available to each compiled query are the
//! step's ancestor `as` bindings plus `root`, mirroring the context names
//! [`crate::context::ContextMap`] will actually hold at that point in the
//! tree.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::errors::CrawlerError;
use crate::plan::{AuthConfig, ParallelismSpec, Plan, RequestSpec, Step};
use crate::query::{self, CompiledQuery, CompiledTemplate};

#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub root_context: Value,
    pub auth: Option<AuthConfig>,
    pub headers: HashMap<String, String>,
    pub stream: bool,
    pub steps: Vec<CompiledStep>,
}

#[derive(Debug, Clone)]
pub enum CompiledStep {
    Request(CompiledRequestStep),
    ForEach(CompiledForEachStep),
    ForValues(CompiledForValuesStep),
}

#[derive(Debug, Clone)]
pub struct CompiledRequestStep {
    pub request: CompiledRequestSpec,
    pub result_transformer: Option<CompiledQuery>,
    pub merge: CompiledMerge,
    pub steps: Vec<CompiledStep>,
}

#[derive(Debug, Clone)]
pub struct CompiledForEachStep {
    pub path: CompiledQuery,
    pub as_name: String,
    pub parallelism: ParallelismSpec,
    pub merge: CompiledMerge,
    pub steps: Vec<CompiledStep>,
}

#[derive(Debug, Clone)]
pub struct CompiledForValuesStep {
    pub values: Vec<Value>,
    pub as_name: String,
    pub steps: Vec<CompiledStep>,
}

/// A compiled request's URL/headers/body, each either a literal or a
/// compiled template, decided once up front by whether `{{ ... }}` markers
/// were present in the source.
#[derive(Debug, Clone)]
pub struct CompiledRequestSpec {
    pub url: CompiledTemplate,
    pub method: String,
    pub headers: Vec<(String, CompiledTemplate)>,
    pub body: Option<Map<String, Value>>,
    pub pagination: Option<crate::plan::PaginationSpec>,
    pub auth: Option<AuthConfig>,
}

/// The merge rule attached to a step, pre-resolved to exactly one variant
/// (validation already guaranteed mutual exclusivity).
#[derive(Debug, Clone)]
pub enum CompiledMerge {
    Default,
    MergeOn(CompiledQuery),
    MergeWithParentOn(CompiledQuery),
    MergeWithContext { name: String, rule: CompiledQuery },
    Noop,
}

struct Scope {
    vars: Vec<String>,
}

impl Scope {
    fn root() -> Self {
        Self { vars: vec!["root".to_string()] }
    }

    fn with(&self, name: &str) -> Self {
        let mut vars = self.vars.clone();
        vars.push(name.to_string());
        Self { vars }
    }
}

pub fn compile_plan(plan: &Plan) -> Result<CompiledPlan, CrawlerError> {
    let scope = Scope::root();
    let steps = compile_steps("steps", &plan.steps, &scope)?;
    Ok(CompiledPlan {
        root_context: plan.root_context.clone(),
        auth: plan.auth.clone(),
        headers: plan.headers.clone(),
        stream: plan.stream,
        steps,
    })
}

fn compile_steps(location: &str, steps: &[Step], scope: &Scope) -> Result<Vec<CompiledStep>, CrawlerError> {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| compile_step(&format!("{location}[{i}]"), step, scope))
        .collect()
}

fn compile_step(location: &str, step: &Step, scope: &Scope) -> Result<CompiledStep, CrawlerError> {
    match step.step_type.as_str() {
        "request" => compile_request_step(location, step, scope),
        "forEach" => compile_for_each_step(location, step, scope),
        "forValues" => compile_for_values_step(location, step, scope),
        _ => Err(CrawlerError::UnknownStepType { location: location.to_string() }),
    }
}

fn compile_request_step(location: &str, step: &Step, scope: &Scope) -> Result<CompiledStep, CrawlerError> {
    let request = step
        .request
        .as_ref()
        .ok_or_else(|| CrawlerError::Compilation {
            location: location.to_string(),
            expression: String::new(),
            cause: "missing request".to_string(),
        })?;

    let compiled_request = compile_request_spec(&format!("{location}.request"), request)?;

    // `$ctx` is bound to the template view (the same context a `request`
    // step's URL/header templates see), not the ancestor `as` scope alone.
    let result_transformer_scope = scope.with("ctx");
    let result_transformer = step
        .result_transformer
        .as_deref()
        .map(|src| compile_query(&format!("{location}.resultTransformer"), src, &result_transformer_scope))
        .transpose()?;

    let merge = compile_merge(location, step, scope)?;
    let steps = compile_steps(&format!("{location}.steps"), &step.steps, scope)?;

    Ok(CompiledStep::Request(CompiledRequestStep {
        request: compiled_request,
        result_transformer,
        merge,
        steps,
    }))
}

fn compile_for_each_step(location: &str, step: &Step, scope: &Scope) -> Result<CompiledStep, CrawlerError> {
    let path_src = step.path.as_deref().unwrap_or(".");
    let path = compile_query(&format!("{location}.path"), path_src, scope)?;

    let as_name = step.as_name.clone().unwrap_or_default();
    let parallelism = step.parallelism.clone().unwrap_or(ParallelismSpec {
        max_concurrency: None,
        requests_per_second: None,
        burst: None,
    });

    let merge = compile_merge(location, step, scope)?;
    let child_scope = scope.with(&as_name);
    let steps = compile_steps(&format!("{location}.steps"), &step.steps, &child_scope)?;

    Ok(CompiledStep::ForEach(CompiledForEachStep {
        path,
        as_name,
        parallelism,
        merge,
        steps,
    }))
}

fn compile_for_values_step(location: &str, step: &Step, scope: &Scope) -> Result<CompiledStep, CrawlerError> {
    let values = step.values.clone().unwrap_or_default();
    let as_name = step.as_name.clone().unwrap_or_default();
    let child_scope = scope.with(&as_name);
    let steps = compile_steps(&format!("{location}.steps"), &step.steps, &child_scope)?;

    Ok(CompiledStep::ForValues(CompiledForValuesStep { values, as_name, steps }))
}

/// Merge rules see `$res` (the value produced by this step), `$ctx` (the
/// existing value at the merge target) and `$new` (alias for `$res`, used by
/// `mergeWithContext` rules) rather than the ancestor `as` bindings in
/// scope for ordinary queries.
fn merge_scope() -> Scope {
    Scope { vars: vec!["res".to_string(), "ctx".to_string(), "new".to_string()] }
}

fn compile_merge(location: &str, step: &Step, _scope: &Scope) -> Result<CompiledMerge, CrawlerError> {
    let merge_vars = merge_scope();
    if let Some(src) = &step.merge_on {
        return Ok(CompiledMerge::MergeOn(compile_query(
            &format!("{location}.mergeOn"),
            src,
            &merge_vars,
        )?));
    }
    if let Some(src) = &step.merge_with_parent_on {
        return Ok(CompiledMerge::MergeWithParentOn(compile_query(
            &format!("{location}.mergeWithParentOn"),
            src,
            &merge_vars,
        )?));
    }
    if let Some(spec) = &step.merge_with_context {
        let rule = compile_query(&format!("{location}.mergeWithContext.rule"), &spec.rule, &merge_vars)?;
        return Ok(CompiledMerge::MergeWithContext { name: spec.name.clone(), rule });
    }
    if step.noop_merge == Some(true) {
        return Ok(CompiledMerge::Noop);
    }
    Ok(CompiledMerge::Default)
}

fn compile_request_spec(location: &str, request: &RequestSpec) -> Result<CompiledRequestSpec, CrawlerError> {
    let url = query::compile_template(&request.url);

    let mut headers = Vec::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        headers.push((name.clone(), query::compile_template(value)));
    }

    let _ = location;
    Ok(CompiledRequestSpec {
        url,
        method: request.method.clone(),
        headers,
        body: request.body.clone(),
        pagination: request.pagination.clone(),
        auth: request.auth.as_deref().cloned(),
    })
}

fn compile_query(location: &str, source: &str, scope: &Scope) -> Result<CompiledQuery, CrawlerError> {
    query::compile(source, &scope.vars).map_err(|e| CrawlerError::Compilation {
        location: location.to_string(),
        expression: source.to_string(),
        cause: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::loader::parse_plan;

    #[test]
    fn compiles_minimal_request_plan() {
        let yaml = "rootContext: {}\nsteps:\n  - type: request\n    request:\n      url: \"https://x/{{ .root }}\"\n";
        let plan = parse_plan(yaml).unwrap();
        let compiled = compile_plan(&plan).unwrap();
        assert_eq!(compiled.steps.len(), 1);
        match &compiled.steps[0] {
            CompiledStep::Request(r) => assert!(r.request.url.has_markers()),
            _ => panic!("expected request step"),
        }
    }

    #[test]
    fn rejects_unbound_variable_in_result_transformer() {
        let yaml = r#"
rootContext: {}
steps:
  - type: request
    resultTransformer: "$bogus"
    request:
      url: https://x
"#;
        let plan = parse_plan(yaml).unwrap();
        let err = compile_plan(&plan).unwrap_err();
        assert!(matches!(err, CrawlerError::Compilation { .. }));
    }

    #[test]
    fn result_transformer_can_reference_ctx() {
        let yaml = r#"
rootContext: {}
steps:
  - type: request
    resultTransformer: "$ctx"
    request:
      url: https://x
"#;
        let plan = parse_plan(yaml).unwrap();
        assert!(compile_plan(&plan).is_ok());
    }

    #[test]
    fn for_each_binding_is_visible_to_nested_steps() {
        let yaml = r#"
rootContext: {}
steps:
  - type: forEach
    path: "."
    as: item
    steps:
      - type: request
        resultTransformer: "$item"
        request:
          url: "https://x/{{ .item }}"
"#;
        let plan = parse_plan(yaml).unwrap();
        assert!(compile_plan(&plan).is_ok());
    }
}
