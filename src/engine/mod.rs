// ============================================================================
// Inference-engine boundary
// ============================================================================
//
// The editing core depends on exactly three capabilities from the external
// engine: construct a session from model bytes plus an execution
// configuration, run a session with named input tensors and get named output
// tensors back, and close the session. Everything else about the engine is
// opaque. `onnx` provides the production implementation on top of a
// dynamically loaded ONNX Runtime; tests substitute a scripted backend.

pub mod onnx;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Errors from the engine boundary.
#[derive(Debug)]
pub enum EngineError {
    RuntimeNotFound(String),
    RuntimeLoadFailed(String),
    ApiInitFailed(String),
    SessionCreateFailed(String),
    InferenceFailed(String),
    InvalidOutput(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::RuntimeNotFound(p) => write!(f, "Runtime library not found: {}", p),
            EngineError::RuntimeLoadFailed(e) => write!(f, "Failed to load runtime library: {}", e),
            EngineError::ApiInitFailed(e) => write!(f, "Runtime API init failed: {}", e),
            EngineError::SessionCreateFailed(e) => write!(f, "Failed to create session: {}", e),
            EngineError::InferenceFailed(e) => write!(f, "Inference failed: {}", e),
            EngineError::InvalidOutput(e) => write!(f, "Invalid output tensor: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

// -- Tensors ------------------------------------------------------------

/// Element storage for a tensor crossing the engine boundary.
///
/// All models used here exchange float32 activations; int64 appears only in
/// prompt tensors (the segmentation decoder's point labels).
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

/// A flat buffer plus its shape. Created transiently per inference call and
/// dropped as soon as the consumer has read it.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    data: TensorData,
}

impl Tensor {
    /// Float tensor. Panics if `data.len()` disagrees with the shape — that
    /// is a programmer error at the call site, not a runtime condition.
    pub fn f32(shape: Vec<i64>, data: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<i64>() as usize,
            data.len(),
            "tensor shape/data mismatch"
        );
        Tensor {
            shape,
            data: TensorData::F32(data),
        }
    }

    /// Int64 tensor (prompt labels and similar).
    pub fn i64(shape: Vec<i64>, data: Vec<i64>) -> Self {
        assert_eq!(
            shape.iter().product::<i64>() as usize,
            data.len(),
            "tensor shape/data mismatch"
        );
        Tensor {
            shape,
            data: TensorData::I64(data),
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        match &self.data {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::I64(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    /// Spatial dims (H, W) for [N,C,H,W] / [C,H,W] / [H,W] shapes.
    pub fn spatial_dims(&self) -> Option<(u32, u32)> {
        match self.shape.len() {
            4 => Some((self.shape[2] as u32, self.shape[3] as u32)),
            3 => Some((self.shape[1] as u32, self.shape[2] as u32)),
            2 => Some((self.shape[0] as u32, self.shape[1] as u32)),
            _ => None,
        }
    }
}

// -- Execution configuration --------------------------------------------

/// Graph-optimization level requested at session build time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationLevel {
    None,
    Basic,
    All,
}

/// Per-model session construction settings.
///
/// Each model identity carries a primary config tuned for it; when session
/// construction fails the registry retries once with [`ExecutionConfig::conservative`]
/// before declaring the model unusable.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub intra_threads: i32,
    pub inter_threads: i32,
    pub optimization: OptimizationLevel,
    /// Attempt a hardware-acceleration execution provider. Missing provider
    /// support downgrades to CPU with a warning, it is not an error.
    pub use_accelerator: bool,
}

impl ExecutionConfig {
    /// Default config for models without specific tuning: all cores, full
    /// optimization, try the accelerator.
    pub fn standard() -> Self {
        ExecutionConfig {
            intra_threads: num_cpus().max(1) as i32,
            inter_threads: num_cpus().max(1) as i32,
            optimization: OptimizationLevel::All,
            use_accelerator: true,
        }
    }

    /// Strictly most-conservative tier: single-threaded, no graph
    /// optimization, no acceleration provider.
    pub fn conservative() -> Self {
        ExecutionConfig {
            intra_threads: 1,
            inter_threads: 1,
            optimization: OptimizationLevel::None,
            use_accelerator: false,
        }
    }

    pub fn with_threads(intra: i32, inter: i32) -> Self {
        ExecutionConfig {
            intra_threads: intra,
            inter_threads: inter,
            optimization: OptimizationLevel::Basic,
            use_accelerator: false,
        }
    }
}

/// Get the number of logical CPU cores (simple heuristic).
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// -- Boundary traits ----------------------------------------------------

/// A live model session. `run` is serialized internally — sessions are not
/// assumed safe for concurrent run calls. Native resources are released when
/// the session is dropped.
pub trait InferenceSession: Send + Sync {
    fn run(&self, inputs: &[(&str, &Tensor)]) -> Result<HashMap<String, Tensor>, EngineError>;
}

/// Constructs sessions from raw model bytes.
pub trait InferenceBackend: Send + Sync {
    fn create_session(
        &self,
        model_bytes: &[u8],
        config: &ExecutionConfig,
    ) -> Result<Box<dyn InferenceSession>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_accessors() {
        let t = Tensor::f32(vec![1, 3, 2, 2], vec![0.0; 12]);
        assert_eq!(t.len(), 12);
        assert_eq!(t.spatial_dims(), Some((2, 2)));
        assert!(t.as_f32().is_some());
        assert!(t.as_i64().is_none());

        let labels = Tensor::i64(vec![1, 1], vec![1]);
        assert_eq!(labels.as_i64(), Some(&[1i64][..]));
    }

    #[test]
    #[should_panic(expected = "shape/data mismatch")]
    fn tensor_shape_mismatch_panics() {
        let _ = Tensor::f32(vec![1, 3], vec![0.0; 4]);
    }

    #[test]
    fn conservative_tier_is_minimal() {
        let c = ExecutionConfig::conservative();
        assert_eq!(c.intra_threads, 1);
        assert_eq!(c.inter_threads, 1);
        assert_eq!(c.optimization, OptimizationLevel::None);
        assert!(!c.use_accelerator);
    }
}
