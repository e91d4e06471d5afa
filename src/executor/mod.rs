//! Step executor (C6): the `request` / `forEach` / `forValues` dispatch and
//! the full request lifecycle (compose URL, apply auth, send, decode,
//! transform, recurse, merge).
//!
//! Generalizes the request-building and response-handling shape of the
//! source project's `executors::http::HttpExecutor` (reusable `reqwest`
//! client, header/body composition, span-instrumented send) onto this
//! spec's context-tree-and-merge model instead of flat assertion/extraction
//! lists.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use reqwest::{Client, Method};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::auth::Authenticator;
use crate::compile::{
    CompiledForEachStep, CompiledForValuesStep, CompiledMerge, CompiledPlan, CompiledRequestSpec,
    CompiledRequestStep, CompiledStep,
};
use crate::context::{build_template_view, Context, ContextMap, MergeLock};
use crate::errors::CrawlerError;
use crate::paginate::{Next as PaginationNext, Paginator};
use crate::parallel::{run_bounded, RateLimiter};
use crate::plan::AuthConfig;
use crate::profiler::{Profiler, StepOutcome};
use crate::query;

pub struct Engine {
    client: Client,
    plan_headers: HashMap<String, String>,
    plan_auth: Option<Arc<Authenticator>>,
    merge_lock: MergeLock,
    profiler: Profiler,
    cancel: watch::Receiver<bool>,
    stream_tx: Option<mpsc::Sender<Value>>,
    streaming: bool,
}

impl Engine {
    pub fn new(
        client: Client,
        plan: &CompiledPlan,
        profiler: Profiler,
        cancel: watch::Receiver<bool>,
        stream_tx: Option<mpsc::Sender<Value>>,
    ) -> Self {
        let plan_auth = plan.auth.clone().map(|cfg| Authenticator::new(client.clone(), cfg));
        Self {
            client,
            plan_headers: plan.headers.clone(),
            plan_auth,
            merge_lock: MergeLock::new(),
            profiler,
            cancel,
            stream_tx,
            streaming: plan.stream,
        }
    }

    fn check_cancelled(&self) -> Result<(), CrawlerError> {
        if *self.cancel.borrow() {
            return Err(CrawlerError::Cancelled);
        }
        Ok(())
    }

    pub fn run_steps<'a>(
        self: &'a Arc<Self>,
        location: &'a str,
        steps: &'a [CompiledStep],
        map: &'a ContextMap,
        caller: &'a Context,
        variables: &'a Map<String, Value>,
        parent_profiler_id: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CrawlerError>> + Send + 'a>> {
        Box::pin(async move {
            for (i, step) in steps.iter().enumerate() {
                self.check_cancelled()?;
                let step_location = format!("{location}[{i}]");
                self.run_step(&step_location, step, map, caller, variables, parent_profiler_id).await?;
            }
            Ok(())
        })
    }

    async fn run_step(
        self: &Arc<Self>,
        location: &str,
        step: &CompiledStep,
        map: &ContextMap,
        caller: &Context,
        variables: &Map<String, Value>,
        parent_profiler_id: Option<u64>,
    ) -> Result<(), CrawlerError> {
        let id = self.profiler.next_id();
        let kind = match step {
            CompiledStep::Request(_) => "request",
            CompiledStep::ForEach(_) => "forEach",
            CompiledStep::ForValues(_) => "forValues",
        };
        self.profiler.start(id, parent_profiler_id, kind, location);
        let started = Instant::now();

        let result = match step {
            CompiledStep::Request(s) => self.run_request_step(location, s, map, caller, variables, Some(id)).await,
            CompiledStep::ForEach(s) => self.run_for_each_step(location, s, map, caller, variables, Some(id)).await,
            CompiledStep::ForValues(s) => self.run_for_values_step(location, s, map, caller, variables, Some(id)).await,
        };

        let outcome = match &result {
            Ok(()) => StepOutcome::Ok,
            Err(e) => StepOutcome::Error(e.to_string()),
        };
        let (before, after) = if self.profiler.is_enabled() {
            let _guard = self.merge_lock.lock().await;
            (Some(build_template_view(map, variables)), Some(build_template_view(map, variables)))
        } else {
            (None, None)
        };
        self.profiler.end(id, started.elapsed().as_millis() as u64, outcome, before, after);

        result
    }

    async fn run_request_step(
        self: &Arc<Self>,
        location: &str,
        step: &CompiledRequestStep,
        map: &ContextMap,
        caller: &Context,
        variables: &Map<String, Value>,
        profiler_id: Option<u64>,
    ) -> Result<(), CrawlerError> {
        let view = {
            let _guard = self.merge_lock.lock().await;
            build_template_view(map, variables)
        };

        let mut paginator = step.request.pagination.clone().map(Paginator::new).transpose()?;

        match &mut paginator {
            None => {
                let (response_body, _url) = self.send_request(location, &step.request, &view).await?;
                self.process_page(location, step, map, caller, variables, profiler_id, &view, response_body).await?;
            }
            Some(paginator) => {
                // Each page runs the full per-step lifecycle (transform,
                // working context, nested steps, merge, drain) before the
                // next page is ever requested, rather than aggregating
                // every page's body up front.
                let base_url = query::render_template(&step.request.url, &view);
                let mut current_url = base_url.clone();
                let mut current_params = paginator.first_page_params();
                loop {
                    self.check_cancelled()?;
                    let page = self
                        .send_paged_request(location, &step.request, &current_url, &current_params, &view)
                        .await?;
                    if page.is_null() {
                        break;
                    }

                    self.process_page(location, step, map, caller, variables, profiler_id, &view, page.clone()).await?;

                    match paginator.next(&page)? {
                        PaginationNext::Stop => break,
                        PaginationNext::Continue { params, next_page_url } => {
                            current_url = next_page_url.unwrap_or_else(|| base_url.clone());
                            current_params = params;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs one page's worth of the request step's lifecycle: resultTransformer
    /// (with `$ctx` bound to the template view), working-context creation,
    /// nested steps, merge, then drain.
    #[allow(clippy::too_many_arguments)]
    async fn process_page(
        self: &Arc<Self>,
        location: &str,
        step: &CompiledRequestStep,
        map: &ContextMap,
        caller: &Context,
        variables: &Map<String, Value>,
        profiler_id: Option<u64>,
        view: &Value,
        response_body: Value,
    ) -> Result<(), CrawlerError> {
        let transformed = match &step.result_transformer {
            Some(compiled) => {
                let mut vars = HashMap::new();
                vars.insert("ctx".to_string(), view.clone());
                query::run(compiled, &response_body, &vars)
                    .map_err(|e| CrawlerError::query(format!("{location}.resultTransformer"), "", e))?
            }
            None => response_body,
        };

        let (extended_map, working, _key) = {
            let _guard = self.merge_lock.lock().await;
            map.new_working(caller, transformed.clone(), |n| map.is_canonical(n))
        };

        self.run_steps(&format!("{location}.steps"), &step.steps, &extended_map, &working, variables, profiler_id)
            .await?;

        self.apply_merge(&extended_map, caller, &step.merge, working.get()).await?;
        self.drain_if_streaming(caller).await;

        Ok(())
    }

    async fn run_for_each_step(
        self: &Arc<Self>,
        location: &str,
        step: &CompiledForEachStep,
        map: &ContextMap,
        caller: &Context,
        variables: &Map<String, Value>,
        profiler_id: Option<u64>,
    ) -> Result<(), CrawlerError> {
        let items = {
            let _guard = self.merge_lock.lock().await;
            let view = build_template_view(map, variables);
            let vars = HashMap::new();
            query::run_array(&step.path, &view, &vars).map_err(|e| CrawlerError::query(format!("{location}.path"), "", e))?
        };
        let items: Vec<Value> = match items {
            Value::Array(items) => items,
            other => vec![other],
        };

        let limiter = step
            .parallelism
            .requests_per_second
            .map(|rps| RateLimiter::new(rps, step.parallelism.burst()));

        let engine = self.clone();
        let loc = location.to_string();
        let steps = step.steps.clone();
        let as_name = step.as_name.clone();
        let map_clone = map.clone();
        let caller_clone = caller.clone();
        let variables_clone = variables.clone();

        let results = run_bounded(items, step.parallelism.max_concurrency(), limiter, self.cancel.clone(), move |item, index| {
            let engine = engine.clone();
            let loc = loc.clone();
            let steps = steps.clone();
            let as_name = as_name.clone();
            let map_clone = map_clone.clone();
            let caller_clone = caller_clone.clone();
            let variables_clone = variables_clone.clone();
            async move {
                let (item_map, item_ctx) = {
                    let _guard = engine.merge_lock.lock().await;
                    map_clone.new_child(&caller_clone, &as_name, item)
                };
                engine
                    .run_steps(&format!("{loc}.steps[{index}]"), &steps, &item_map, &item_ctx, &variables_clone, None)
                    .await?;
                let value = {
                    let _guard = engine.merge_lock.lock().await;
                    item_ctx.get()
                };
                Ok(value)
            }
        })
        .await;

        let mut collected = Vec::with_capacity(results.len());
        for result in results {
            collected.push(result?);
        }

        self.apply_merge(map, caller, &step.merge, Value::Array(collected)).await?;
        self.drain_if_streaming(caller).await;
        let _ = profiler_id;
        Ok(())
    }

    async fn run_for_values_step(
        self: &Arc<Self>,
        location: &str,
        step: &CompiledForValuesStep,
        map: &ContextMap,
        caller: &Context,
        variables: &Map<String, Value>,
        profiler_id: Option<u64>,
    ) -> Result<(), CrawlerError> {
        for (i, value) in step.values.iter().enumerate() {
            self.check_cancelled()?;
            let (overlay_map, overlay_ctx) = {
                let _guard = self.merge_lock.lock().await;
                map.new_overlay(caller, &step.as_name, value.clone())
            };
            self.run_steps(&format!("{location}.steps[{i}]"), &step.steps, &overlay_map, &overlay_ctx, variables, profiler_id)
                .await?;
        }
        Ok(())
    }

    /// If streaming is enabled and `caller` sits at the streaming boundary
    /// (depth 0 or 1), drains any array value it now holds into the stream
    /// channel one element at a time and resets it to an empty sequence, so
    /// a host reading `GetData()` after the run sees only what never made it
    /// into the stream.
    async fn drain_if_streaming(&self, caller: &Context) {
        if !self.streaming || caller.depth > 1 {
            return;
        }
        let Some(tx) = self.stream_tx.clone() else {
            return;
        };
        let items = {
            let _guard = self.merge_lock.lock().await;
            match caller.get() {
                Value::Array(items) if !items.is_empty() => {
                    caller.set(Value::Array(Vec::new()));
                    items
                }
                _ => return,
            }
        };
        for item in items {
            let _ = tx.send(item).await;
        }
    }

    async fn apply_merge(
        &self,
        map: &ContextMap,
        caller: &Context,
        merge: &CompiledMerge,
        result_value: Value,
    ) -> Result<(), CrawlerError> {
        let _guard = self.merge_lock.lock().await;
        match merge {
            CompiledMerge::Noop => {}
            CompiledMerge::Default => {
                let current = caller.get();
                caller.set(query::default_merge(current, result_value));
            }
            CompiledMerge::MergeOn(compiled) => {
                let current = caller.get();
                let vars = merge_vars(&result_value, &current);
                let next = query::run(compiled, &current, &vars).map_err(|e| CrawlerError::query("merge", "", e))?;
                caller.set(next);
            }
            CompiledMerge::MergeWithParentOn(compiled) => {
                if let Some(parent) = map.get(&caller.parent) {
                    let current = parent.get();
                    let vars = merge_vars(&result_value, &current);
                    let next = query::run(compiled, &current, &vars).map_err(|e| CrawlerError::query("merge", "", e))?;
                    parent.set(next);
                }
            }
            CompiledMerge::MergeWithContext { name, rule } => {
                if let Some(target) = map.get(name) {
                    let current = target.get();
                    let vars = merge_vars(&result_value, &current);
                    let next = query::run(rule, &current, &vars).map_err(|e| CrawlerError::query("merge", "", e))?;
                    target.set(next);
                } else {
                    return Err(CrawlerError::UnknownContext { location: "mergeWithContext".to_string(), name: name.clone() });
                }
            }
        }
        Ok(())
    }

    async fn send_request(
        &self,
        location: &str,
        spec: &CompiledRequestSpec,
        view: &Value,
    ) -> Result<(Value, String), CrawlerError> {
        let url = query::render_template(&spec.url, view);
        let body = spec.body.as_ref().map(|b| render_templates(&Value::Object(b.clone()), view));
        let response_body = self
            .dispatch(location, spec, &url, &spec.headers.iter().map(|(k, v)| (k.clone(), query::render_template(v, view))).collect::<Vec<_>>(), body)
            .await?;
        Ok((response_body, url))
    }

    async fn send_paged_request(
        &self,
        location: &str,
        spec: &CompiledRequestSpec,
        url: &str,
        params: &crate::paginate::PageParams,
        view: &Value,
    ) -> Result<Value, CrawlerError> {
        let mut full_url = sanitize_next_page_url(url);
        if !params.query.is_empty() {
            let encoded: Vec<String> = params
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", percent_encoding::utf8_percent_encode(k, percent_encoding::NON_ALPHANUMERIC), percent_encoding::utf8_percent_encode(v, percent_encoding::NON_ALPHANUMERIC)))
                .collect();
            let sep = if full_url.contains('?') { "&" } else { "?" };
            full_url = format!("{full_url}{sep}{}", encoded.join("&"));
        }
        let mut headers: Vec<(String, String)> =
            spec.headers.iter().map(|(k, v)| (k.clone(), query::render_template(v, view))).collect();
        headers.extend(params.headers.clone());

        let mut body = spec.body.as_ref().map(|b| render_templates(&Value::Object(b.clone()), view));
        if !params.body.is_empty() {
            if let Some(Value::Object(map)) = &mut body {
                for (k, v) in &params.body {
                    map.insert(k.clone(), v.clone());
                }
            }
        }

        self.dispatch(location, spec, &full_url, &headers, body).await
    }

    async fn dispatch(
        &self,
        location: &str,
        spec: &CompiledRequestSpec,
        url: &str,
        headers: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value, CrawlerError> {
        let method = Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| CrawlerError::Compilation { location: location.to_string(), expression: spec.method.clone(), cause: "invalid HTTP method".to_string() })?;

        let header_pairs: Vec<(String, String)> = self
            .plan_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(headers.iter().cloned())
            .collect();
        let header_map = build_header_map(url, &header_pairs)?;

        let content_type = header_map
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());

        let mut builder = self.client.request(method, url).headers(header_map);
        if let Some(body) = &body {
            let encoded = encode_request_body(location, content_type.as_deref(), body)?;
            builder = builder.body(encoded);
        }

        builder = match self.authenticator_for(spec.auth.as_ref()) {
            Some(auth) => auth.apply(builder).await?,
            None => builder,
        };

        let response = builder.send().await.map_err(|e| CrawlerError::transport(url.to_string(), e))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !content_type.contains("json") && !content_type.is_empty() {
            return Err(CrawlerError::UnsupportedContentType { location: location.to_string(), content_type });
        }

        let bytes = response.bytes().await.map_err(|e| CrawlerError::transport(url.to_string(), e))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| CrawlerError::UnsupportedContentType { location: location.to_string(), content_type: format!("invalid JSON body: {e}") })
    }

    fn authenticator_for(&self, override_auth: Option<&AuthConfig>) -> Option<Arc<Authenticator>> {
        match override_auth {
            Some(cfg) => Some(Authenticator::new(self.client.clone(), cfg.clone())),
            None => self.plan_auth.clone(),
        }
    }
}

/// A server-issued `nextPageUrl` is an opaque token from the API's point of
/// view, not a URL the engine itself composed, so a bare `#` in its query
/// component must not be read as a fragment delimiter: it is escaped to
/// `%23` before the URL is handed to `reqwest`. Everything before the first
/// `?` (scheme/host/path) is left untouched.
fn sanitize_next_page_url(url: &str) -> String {
    match url.split_once('?') {
        Some((head, query)) => format!("{head}?{}", query.replace('#', "%23")),
        None => url.to_string(),
    }
}

/// Builds a `HeaderMap` from literal `(name, value)` pairs via
/// `HeaderName::from_bytes`/`HeaderValue::from_str` on the configured
/// casing, rather than `RequestBuilder::header`'s canonicalizing convenience
/// setter, so header names reach the wire byte-identical to how they were
/// configured.
fn build_header_map(url: &str, pairs: &[(String, String)]) -> Result<reqwest::header::HeaderMap, CrawlerError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in pairs {
        let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| CrawlerError::transport(url, format!("invalid header name `{name}`: {e}")))?;
        let header_value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| CrawlerError::transport(url, format!("invalid header value for `{name}`: {e}")))?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

/// Encodes a request body per its declared `Content-Type` instead of always
/// calling `RequestBuilder::json`: `application/json` serializes the body
/// directly, `application/x-www-form-urlencoded` percent-encodes it as form
/// pairs. Validation already requires `Content-Type` for a POST with a body,
/// so a missing or unsupported one here is a runtime `UnsupportedContentType`.
fn encode_request_body(location: &str, content_type: Option<&str>, value: &Value) -> Result<Vec<u8>, CrawlerError> {
    match content_type {
        Some(ct) if ct.starts_with("application/json") => serde_json::to_vec(value).map_err(|e| CrawlerError::Compilation {
            location: location.to_string(),
            expression: String::new(),
            cause: e.to_string(),
        }),
        Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => Ok(encode_form_body(value).into_bytes()),
        other => Err(CrawlerError::UnsupportedContentType {
            location: location.to_string(),
            content_type: other.unwrap_or_default().to_string(),
        }),
    }
}

/// Percent-encodes a JSON object's top-level fields as
/// `application/x-www-form-urlencoded` pairs, consistent with how pagination
/// query parameters are already encoded in [`Engine::send_paged_request`].
fn encode_form_body(value: &Value) -> String {
    let Value::Object(map) = value else {
        return String::new();
    };
    map.iter()
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string().trim_matches('"').to_string(),
            };
            format!(
                "{}={}",
                percent_encoding::utf8_percent_encode(k, percent_encoding::NON_ALPHANUMERIC),
                percent_encoding::utf8_percent_encode(&rendered, percent_encoding::NON_ALPHANUMERIC)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn merge_vars(result_value: &Value, current: &Value) -> HashMap<String, Value> {
    let mut vars = HashMap::new();
    vars.insert("res".to_string(), result_value.clone());
    vars.insert("new".to_string(), result_value.clone());
    vars.insert("ctx".to_string(), current.clone());
    vars
}

/// Recursively renders `{{ .ident }}` markers in every string leaf of a
/// JSON value against `view`. Compiled once per body field at send time
/// rather than at plan-compile time, since a request body's shape is
/// arbitrary nested JSON rather than a single known template slot.
fn render_templates(value: &Value, view: &Value) -> Value {
    match value {
        Value::String(s) => {
            let tpl = query::compile_template(s);
            if tpl.has_markers() {
                Value::String(query::render_template(&tpl, view))
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_templates(v, view)).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), render_templates(v, view))).collect()),
        other => other.clone(),
    }
}
