//! Engine error taxonomy.
//!
//! `ConfigError` is the only error that escapes a run: it is raised
//! before any HTTP call and means the run never started. Everything
//! that happens during a run is captured at the node that produced it
//! and surfaces as a status in the result tree.

use thiserror::Error;

/// Configuration problems detected before execution starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}' not found")]
    MissingReference { kind: &'static str, id: String },

    #[error("cycle detected through component '{id}' (path: {path})")]
    CycleDetected { id: String, path: String },

    #[error("child reference in '{owner}' must set exactly one of script_id/component_id")]
    MalformedChildRef { owner: String },

    #[error("store error: {0}")]
    Store(String),
}

/// An unresolved `{{placeholder}}` during rendering.
#[derive(Debug, Error)]
#[error("variable '{name}' not found while rendering {path}")]
pub struct VariableNotFound {
    pub name: String,
    /// Node path of the template being rendered, e.g.
    /// `script login-user/headers.Authorization`.
    pub path: String,
}

/// Failures of the HTTP pipeline. Terminal pipeline errors map to node
/// status ERROR, distinguishable from assertion failures (FAILED).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("request cancelled by run deadline")]
    Cancelled,
}

impl PipelineError {
    /// Attempt count to record on the owning node.
    pub fn attempts(&self) -> u32 {
        match self {
            PipelineError::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

/// Umbrella error for [`crate::Engine::run`]. In practice only the
/// `Config` variant crosses the run boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}
