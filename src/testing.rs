// ============================================================================
// Test utilities — scripted inference backends, temp asset dirs
// ============================================================================
//
// Pipelines are exercised end-to-end without ONNX Runtime by scripting the
// engine boundary: a backend closure builds sessions, a session closure maps
// named inputs to named outputs.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::engine::{
    EngineError, ExecutionConfig, InferenceBackend, InferenceSession, Tensor,
};
use crate::registry::{ModelAssets, ModelKind, ModelRegistry, default_specs};

/// Shared run closure for scripted sessions.
pub type RunFn =
    Arc<dyn Fn(&[(&str, &Tensor)]) -> Result<HashMap<String, Tensor>, EngineError> + Send + Sync>;

/// A session driven by a closure.
pub struct FnSession {
    run: RunFn,
}

impl FnSession {
    pub fn new(run: RunFn) -> Self {
        FnSession { run }
    }
}

impl InferenceSession for FnSession {
    fn run(&self, inputs: &[(&str, &Tensor)]) -> Result<HashMap<String, Tensor>, EngineError> {
        (self.run)(inputs)
    }
}

/// A backend driven by a closure over (model bytes, execution config).
pub struct ScriptedBackend {
    factory: Box<
        dyn Fn(&[u8], &ExecutionConfig) -> Result<Box<dyn InferenceSession>, EngineError>
            + Send
            + Sync,
    >,
}

impl ScriptedBackend {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&[u8], &ExecutionConfig) -> Result<Box<dyn InferenceSession>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        ScriptedBackend {
            factory: Box::new(factory),
        }
    }

    /// Every session echoes its first input back under the name "output".
    pub fn identity() -> Self {
        ScriptedBackend::new(|_bytes, _config| {
            let run: RunFn = Arc::new(|inputs| {
                let (_, tensor) = inputs.first().ok_or_else(|| {
                    EngineError::InferenceFailed("no inputs".to_string())
                })?;
                let mut out = HashMap::new();
                out.insert("output".to_string(), (*tensor).clone());
                Ok(out)
            });
            Ok(Box::new(FnSession::new(run)))
        })
    }
}

impl InferenceBackend for ScriptedBackend {
    fn create_session(
        &self,
        model_bytes: &[u8],
        config: &ExecutionConfig,
    ) -> Result<Box<dyn InferenceSession>, EngineError> {
        (self.factory)(model_bytes, config)
    }
}

// -- Counting backend for registry lifecycle tests ----------------------

enum CountingMode {
    AlwaysOk,
    ConservativeOnly,
    AlwaysFail,
}

/// Backend that records construction attempts and the last config used.
pub struct CountingBackend {
    pub attempts: AtomicUsize,
    pub created: AtomicUsize,
    pub last_config: std::sync::Mutex<Option<ExecutionConfig>>,
    mode: CountingMode,
}

impl CountingBackend {
    fn with_mode(mode: CountingMode) -> Self {
        CountingBackend {
            attempts: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            last_config: std::sync::Mutex::new(None),
            mode,
        }
    }

    pub fn always_ok() -> Self {
        Self::with_mode(CountingMode::AlwaysOk)
    }

    /// Fails for every config except [`ExecutionConfig::conservative`].
    pub fn conservative_only() -> Self {
        Self::with_mode(CountingMode::ConservativeOnly)
    }

    pub fn always_fail() -> Self {
        Self::with_mode(CountingMode::AlwaysFail)
    }
}

impl InferenceBackend for CountingBackend {
    fn create_session(
        &self,
        _model_bytes: &[u8],
        config: &ExecutionConfig,
    ) -> Result<Box<dyn InferenceSession>, EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(*config);

        let ok = match self.mode {
            CountingMode::AlwaysOk => true,
            CountingMode::ConservativeOnly => *config == ExecutionConfig::conservative(),
            CountingMode::AlwaysFail => false,
        };
        if !ok {
            return Err(EngineError::SessionCreateFailed(
                "scripted construction failure".to_string(),
            ));
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        let run: RunFn = Arc::new(|inputs| {
            let mut out = HashMap::new();
            if let Some((_, tensor)) = inputs.first() {
                out.insert("output".to_string(), (*tensor).clone());
            }
            Ok(out)
        });
        Ok(Box::new(FnSession::new(run)))
    }
}

// -- Temp dirs ----------------------------------------------------------

static NEXT_DIR: AtomicU64 = AtomicU64::new(0);

/// Throwaway bundle/cache directory pair, removed on drop.
pub struct TempDirs {
    pub bundle: PathBuf,
    pub cache: PathBuf,
    root: PathBuf,
}

impl TempDirs {
    pub fn new() -> Self {
        let n = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "retouchfe-test-{}-{}",
            std::process::id(),
            n
        ));
        let bundle = root.join("bundle");
        let cache = root.join("cache");
        fs::create_dir_all(&bundle).unwrap();
        fs::create_dir_all(&cache).unwrap();
        TempDirs {
            bundle,
            cache,
            root,
        }
    }
}

impl Default for TempDirs {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempDirs {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

// -- Registry builder ---------------------------------------------------

/// Build a registry whose model identities are served by the given run
/// closures. Asset files are written with per-identity marker bytes so the
/// scripted backend can route session construction.
pub fn mock_registry(sessions: Vec<(ModelKind, RunFn)>) -> (TempDirs, ModelRegistry) {
    let dirs = TempDirs::new();
    let specs = default_specs();

    let mut by_bytes: HashMap<Vec<u8>, RunFn> = HashMap::new();
    for (kind, run) in sessions {
        let spec = specs.get(&kind).expect("unknown model kind");
        let marker = format!("mock:{:?}", kind).into_bytes();
        fs::write(dirs.bundle.join(&spec.file_name), &marker).unwrap();
        by_bytes.insert(marker, run);
    }

    let backend = ScriptedBackend::new(move |bytes, _config| {
        by_bytes
            .get(bytes)
            .cloned()
            .map(|run| Box::new(FnSession::new(run)) as Box<dyn InferenceSession>)
            .ok_or_else(|| {
                EngineError::SessionCreateFailed("no scripted session for model bytes".to_string())
            })
    });

    let assets = ModelAssets::new(&dirs.bundle, &dirs.cache);
    let registry = ModelRegistry::new(Arc::new(backend), assets);
    (dirs, registry)
}
