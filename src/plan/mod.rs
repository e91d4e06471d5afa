//! The plan wire schema (§6 External Interfaces) and its YAML loader (C9).
//!
//! Mirrors the source project's `protocol` module in spirit — a flat,
//! generously-`Option`al wire struct per concept, validated by a separate
//! pass rather than leaning on `serde`'s `deny_unknown_fields` — but the
//! shape itself is this spec's `request`/`forEach`/`forValues` tagged union
//! instead of the source UTDL's single `action` string.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

pub mod loader;

#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    #[serde(rename = "rootContext")]
    pub root_context: Value,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub stream: bool,
    pub steps: Vec<Step>,
}

/// One node of the step tree. All fields are optional at the wire level;
/// [`crate::validate`] enforces which combinations are legal per `type`.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: String,

    // `request` fields
    #[serde(default)]
    pub request: Option<RequestSpec>,
    #[serde(rename = "resultTransformer", default)]
    pub result_transformer: Option<String>,

    // `forEach` fields
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub parallelism: Option<ParallelismSpec>,

    // `forValues` fields
    #[serde(default)]
    pub values: Option<Vec<Value>>,

    // shared `as` (forEach / forValues)
    #[serde(rename = "as", default)]
    pub as_name: Option<String>,

    // merge options (shared vocabulary, legality enforced per step type)
    #[serde(rename = "mergeOn", default)]
    pub merge_on: Option<String>,
    #[serde(rename = "mergeWithParentOn", default)]
    pub merge_with_parent_on: Option<String>,
    #[serde(rename = "mergeWithContext", default)]
    pub merge_with_context: Option<MergeWithContextSpec>,
    #[serde(rename = "noopMerge", default)]
    pub noop_merge: Option<bool>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeWithContextSpec {
    pub name: String,
    pub rule: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParallelismSpec {
    #[serde(rename = "maxConcurrency", default)]
    pub max_concurrency: Option<usize>,
    #[serde(rename = "requestsPerSecond", default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub burst: Option<usize>,
}

impl ParallelismSpec {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
    pub const DEFAULT_BURST: usize = 1;

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(Self::DEFAULT_MAX_CONCURRENCY)
    }

    pub fn burst(&self) -> usize {
        self.burst.unwrap_or(Self::DEFAULT_BURST)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Map<String, Value>>,
    #[serde(default)]
    pub pagination: Option<PaginationSpec>,
    /// Boxed: a login sub-request can itself carry `auth`, which would
    /// otherwise make `AuthConfig` an infinitely-sized type.
    #[serde(default)]
    pub auth: Option<Box<AuthConfig>>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationSpec {
    #[serde(rename = "nextPageUrlSelector", default)]
    pub next_page_url_selector: Option<String>,
    #[serde(default)]
    pub params: Option<Vec<PaginationParam>>,
    #[serde(rename = "stopOn", default)]
    pub stop_on: Option<Vec<StopCondition>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParam {
    pub name: String,
    pub location: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub increment: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StopCondition {
    PageNum { value: u64 },
    ResponseBody { query: String },
    RequestParam { param: String, op: String, value: String },
}

/// Authenticator configuration, tagged by `type`. `oauth` carries a `flow`
/// sub-discriminant distinguishing the password grant from the
/// client-credentials grant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    Oauth {
        flow: OauthFlow,
        #[serde(rename = "tokenUrl")]
        token_url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(rename = "clientId", default)]
        client_id: Option<String>,
        #[serde(rename = "clientSecret", default)]
        client_secret: Option<String>,
        #[serde(default)]
        scopes: Option<Vec<String>>,
    },
    Cookie {
        #[serde(rename = "loginRequest")]
        login_request: RequestSpec,
        #[serde(rename = "cookieName")]
        cookie_name: String,
        #[serde(rename = "maxAgeSeconds")]
        max_age_seconds: u64,
    },
    Jwt {
        #[serde(rename = "loginRequest")]
        login_request: RequestSpec,
        #[serde(rename = "tokenPath", default)]
        token_path: Option<String>,
        #[serde(rename = "tokenHeader", default)]
        token_header: Option<String>,
        #[serde(rename = "maxAgeSeconds")]
        max_age_seconds: u64,
    },
    Custom {
        #[serde(rename = "loginRequest")]
        login_request: RequestSpec,
        #[serde(rename = "extractFrom")]
        extract_from: String,
        #[serde(rename = "extractSelector")]
        extract_selector: String,
        #[serde(rename = "injectInto")]
        inject_into: String,
        #[serde(rename = "injectKey")]
        inject_key: String,
        #[serde(rename = "maxAgeSeconds", default)]
        max_age_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OauthFlow {
    Password,
    ClientCredentials,
}
