// ============================================================================
// Crate-wide error taxonomy
// ============================================================================

use crate::engine::EngineError;

/// Errors surfaced by the editing core.
///
/// Pipelines catch these at their boundary and translate them into either a
/// safe fallback value (segmentation refinement returns the rough mask) or a
/// single user-facing message; they never cross the control thread as a
/// panic.
#[derive(Debug)]
pub enum EditError {
    /// Model asset missing/corrupt, or session construction failed even with
    /// the conservative configuration. Terminal for that model identity.
    ModelLoad(String),
    /// A loaded session's run call failed.
    Inference(String),
    /// Inference succeeded but an output tensor had an unexpected name,
    /// shape, or element type.
    InvalidOutput(String),
    /// Degenerate geometry with no sane clamp (zero-size region, mismatched
    /// buffer dimensions).
    Geometry(String),
    /// File I/O in the CLI layer.
    Io(String),
}

impl std::fmt::Display for EditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditError::ModelLoad(e) => write!(f, "Model load failed: {}", e),
            EditError::Inference(e) => write!(f, "Inference failed: {}", e),
            EditError::InvalidOutput(e) => write!(f, "Invalid model output: {}", e),
            EditError::Geometry(e) => write!(f, "Invalid geometry: {}", e),
            EditError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EditError {}

impl From<EngineError> for EditError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::RuntimeNotFound(_)
            | EngineError::RuntimeLoadFailed(_)
            | EngineError::ApiInitFailed(_)
            | EngineError::SessionCreateFailed(_) => EditError::ModelLoad(e.to_string()),
            EngineError::InferenceFailed(m) => EditError::Inference(m),
            EngineError::InvalidOutput(m) => EditError::InvalidOutput(m),
        }
    }
}

impl From<std::io::Error> for EditError {
    fn from(e: std::io::Error) -> Self {
        EditError::Io(e.to_string())
    }
}
