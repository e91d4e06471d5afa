//! `api_crawler`: a declarative plan execution engine for crawling HTTP
//! APIs. A plan is a YAML tree of `request` / `forEach` / `forValues` steps
//! sharing a hierarchical JSON context, executed against real endpoints
//! with pagination, polymorphic auth, parallel `forEach` dispatch, and an
//! optional profiler event stream.
//!
//! The public surface is [`ApiCrawler`]: load a plan with [`ApiCrawler::new`],
//! optionally attach a profiler or data stream, then [`ApiCrawler::run`] it
//! against a cancellation signal and runtime variables.

pub mod auth;
pub mod compile;
pub mod context;
pub mod crawler;
pub mod errors;
pub mod executor;
pub mod paginate;
pub mod parallel;
pub mod plan;
pub mod profiler;
pub mod query;
pub mod telemetry;
pub mod validate;

pub use crawler::{ApiCrawler, SetupError};
pub use errors::{CrawlerError, ValidationError, ValidationResult};
pub use plan::loader::PlanSource;
pub use plan::Plan;
pub use profiler::{ProfilerEvent, StepOutcome};
