//! The library surface: [`ApiCrawler`] ties plan loading, validation,
//! compilation, and execution into the single entry point a host embeds,
//! mirroring the source project's top-level `execute_plan` flow in
//! `main.rs` but exposed as a reusable type instead of being inlined in the
//! CLI.

use std::sync::Arc;

use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::compile::{self, CompiledPlan};
use crate::context::{normalize_variables, Context, ContextMap};
use crate::errors::{CrawlerError, ValidationError};
use crate::executor::Engine;
use crate::plan::loader::{self, PlanSource};
use crate::profiler::{Profiler, ProfilerEvent};
use crate::validate::validate_plan;

/// Everything that can go wrong building a crawler before `run` is ever
/// called: the plan failed to parse, failed structural validation, or
/// failed compilation.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to load plan: {0}")]
    Load(#[from] anyhow::Error),
    #[error("plan failed compilation: {0}")]
    Compile(#[from] CrawlerError),
}

pub struct ApiCrawler {
    compiled: CompiledPlan,
    client: Client,
    profiler: Profiler,
    root_context: Context,
    root_map: ContextMap,
    stream_tx: Option<mpsc::Sender<Value>>,
}

impl ApiCrawler {
    /// Loads, validates, and compiles a plan. Returns `(Some(crawler), ..)`
    /// only when there were no validation errors and no setup error;
    /// validation errors are always returned in full even when they make
    /// compilation impossible, per this crate's "report everything, abort
    /// nothing prematurely" validation stance.
    pub fn new<'a>(source: impl Into<PlanSource<'a>>) -> (Option<Self>, Vec<ValidationError>, Option<SetupError>) {
        let plan = match loader::load_plan(source.into()) {
            Ok(plan) => plan,
            Err(e) => return (None, Vec::new(), Some(SetupError::Load(e))),
        };

        let validation_errors = validate_plan(&plan);
        if !validation_errors.is_empty() {
            return (None, validation_errors, None);
        }

        let compiled = match compile::compile_plan(&plan) {
            Ok(c) => c,
            Err(e) => return (None, Vec::new(), Some(SetupError::Compile(e))),
        };

        let root_map = ContextMap::with_root(compiled.root_context.clone());
        let root_context = root_map.root().clone();

        (
            Some(Self {
                compiled,
                client: Client::new(),
                profiler: Profiler::disabled(),
                root_context,
                root_map,
                stream_tx: None,
            }),
            Vec::new(),
            None,
        )
    }

    /// Overrides the `reqwest::Client` used for every request this crawler
    /// sends, e.g. to point at a test server's loopback address or to
    /// attach a proxy/mTLS configuration.
    pub fn set_client(&mut self, client: Client) {
        self.client = client;
    }

    /// Attaches a profiler, returning the receiving end of its event
    /// stream. Must be called before [`Self::run`].
    pub fn enable_profiler(&mut self) -> mpsc::Receiver<ProfilerEvent> {
        let (profiler, rx) = Profiler::new(256);
        self.profiler = profiler;
        rx
    }

    /// If the plan declares `stream: true`, returns a receiver of each leaf
    /// result as it is produced, rather than requiring the caller to wait
    /// for [`Self::run`] to finish and call [`Self::get_data`].
    pub fn get_data_stream(&mut self) -> Option<mpsc::Receiver<Value>> {
        if !self.compiled.stream {
            return None;
        }
        let (tx, rx) = mpsc::channel(256);
        self.stream_tx = Some(tx);
        Some(rx)
    }

    pub async fn run(&mut self, cancel: watch::Receiver<bool>, variables: Map<String, Value>) -> Result<(), CrawlerError> {
        let variables = normalize_variables(variables);
        let engine = Arc::new(Engine::new(
            self.client.clone(),
            &self.compiled,
            self.profiler.clone(),
            cancel,
            self.stream_tx.take(),
        ));
        engine
            .run_steps("steps", &self.compiled.steps, &self.root_map, &self.root_context, &variables, None)
            .await
    }

    pub fn get_data(&self) -> Value {
        self.root_context.get()
    }
}
