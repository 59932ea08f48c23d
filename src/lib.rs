//! Hadron test execution engine.
//!
//! Runs API test entities (scripts, components, test cases) against
//! live HTTP endpoints and produces a hierarchical result tree.
//! Authoring and persistence live outside this crate; the engine
//! consumes entities read-only through [`store::DefinitionStore`].

pub mod assertion;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod template;
pub mod trace;

pub use context::ExecutionContext;
pub use error::{ConfigError, EngineError, PipelineError};
pub use executor::{Engine, RunOptions};
pub use graph::ResolvedGraph;
pub use model::*;
pub use pipeline::RetryPolicy;
pub use store::{DefinitionStore, MemoryStore};
pub use trace::{TraceEvent, TraceSink};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
