// ============================================================================
// Model registry — session lifetimes, asset cache, execution-config tiers
// ============================================================================
//
// One live session per model identity. The first `acquire` for an identity
// locates the model bytes (bundled assets, copied once into a writable cache
// directory), builds a session with that model's execution configuration,
// and retries once with the conservative tier if construction fails. The
// outcome — ready or failed — is recorded as a tagged variant; a failed
// identity stays failed until teardown. Steady-state `acquire` of a loaded
// session is a lock-free read; only first-load takes the loading lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::codec::{Normalization, TensorLayout};
use crate::engine::{ExecutionConfig, InferenceBackend, InferenceSession};
use crate::error::EditError;
use crate::{log_info, log_warn};

// -- Model identities ---------------------------------------------------

/// Logical model identity. Each identity maps to one asset file and one
/// fixed tensor contract in the table below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    FaceRestoration,
    Inpainting,
    Upscaler,
    Segmentation,
    SamEncoder,
    SamDecoder,
}

impl ModelKind {
    pub const ALL: [ModelKind; 6] = [
        ModelKind::FaceRestoration,
        ModelKind::Inpainting,
        ModelKind::Upscaler,
        ModelKind::Segmentation,
        ModelKind::SamEncoder,
        ModelKind::SamDecoder,
    ];

    fn slot(self) -> usize {
        match self {
            ModelKind::FaceRestoration => 0,
            ModelKind::Inpainting => 1,
            ModelKind::Upscaler => 2,
            ModelKind::Segmentation => 3,
            ModelKind::SamEncoder => 4,
            ModelKind::SamDecoder => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelKind::FaceRestoration => "face restoration",
            ModelKind::Inpainting => "object removal",
            ModelKind::Upscaler => "image upscaler",
            ModelKind::Segmentation => "background segmentation",
            ModelKind::SamEncoder => "mask refinement encoder",
            ModelKind::SamDecoder => "mask refinement decoder",
        }
    }
}

// -- Model contracts ----------------------------------------------------

/// A model's fixed input/output contract plus its session configuration.
/// Treated as configuration data fixed at integration time — layouts and
/// normalization constants are never auto-detected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSpec {
    pub file_name: String,
    /// Square image-input edge in pixels; 0 for prompt-only models (the
    /// segmentation decoder takes embeddings, not an image).
    pub input_size: u32,
    pub layout: TensorLayout,
    pub normalization: Normalization,
    pub session: ExecutionConfig,
}

/// Built-in contract table, mirroring the bundled model set.
pub fn default_specs() -> HashMap<ModelKind, ModelSpec> {
    let mut specs = HashMap::new();
    specs.insert(
        ModelKind::FaceRestoration,
        ModelSpec {
            file_name: "gfpgan_v1_4.onnx".to_string(),
            input_size: 512,
            layout: TensorLayout::ChannelMajor,
            normalization: Normalization::SYMMETRIC,
            session: ExecutionConfig::standard(),
        },
    );
    specs.insert(
        ModelKind::Inpainting,
        ModelSpec {
            file_name: "lama.onnx".to_string(),
            input_size: 512,
            layout: TensorLayout::ChannelMajor,
            normalization: Normalization::UNIT,
            // The inpainting model is memory-hungry; keep it on a small CPU budget
            session: ExecutionConfig::with_threads(2, 1),
        },
    );
    specs.insert(
        ModelKind::Upscaler,
        ModelSpec {
            file_name: "edsr_x2.onnx".to_string(),
            input_size: 256,
            layout: TensorLayout::ChannelMajor,
            normalization: Normalization::UNIT,
            session: ExecutionConfig::standard(),
        },
    );
    specs.insert(
        ModelKind::Segmentation,
        ModelSpec {
            file_name: "u2net.onnx".to_string(),
            input_size: 320,
            layout: TensorLayout::ChannelMajor,
            normalization: Normalization::UNIT,
            session: ExecutionConfig::with_threads(3, 2),
        },
    );
    specs.insert(
        ModelKind::SamEncoder,
        ModelSpec {
            file_name: "mobile_sam_encoder.onnx".to_string(),
            input_size: 1024,
            layout: TensorLayout::ChannelMajor,
            normalization: Normalization::IMAGENET,
            session: ExecutionConfig::standard(),
        },
    );
    specs.insert(
        ModelKind::SamDecoder,
        ModelSpec {
            file_name: "mobile_sam_decoder.onnx".to_string(),
            input_size: 0,
            layout: TensorLayout::ChannelMajor,
            normalization: Normalization::UNIT,
            session: ExecutionConfig::standard(),
        },
    );
    specs
}

// -- Asset store --------------------------------------------------------

/// Locates model bytes. Bundled assets are read-only; on first use a model
/// is copied into the writable cache directory, and later loads read the
/// cached copy (idempotent — the copy is skipped when already present).
pub struct ModelAssets {
    bundle_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ModelAssets {
    pub fn new(bundle_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        ModelAssets {
            bundle_dir: bundle_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Read a model's bytes, caching the bundled asset on first use.
    pub fn load(&self, file_name: &str) -> Result<Vec<u8>, EditError> {
        validate_model_name(file_name)?;

        let cached = self.cache_dir.join(file_name);
        if !cached.exists() {
            let bundled = self.bundle_dir.join(file_name);
            if !bundled.exists() {
                return Err(EditError::ModelLoad(format!(
                    "Model asset not found: {}",
                    bundled.display()
                )));
            }
            fs::create_dir_all(&self.cache_dir)
                .map_err(|e| EditError::ModelLoad(format!("Create cache dir: {}", e)))?;
            log_info!("Caching model asset {} -> {}", file_name, cached.display());
            fs::copy(&bundled, &cached)
                .map_err(|e| EditError::ModelLoad(format!("Cache {}: {}", file_name, e)))?;
        }

        fs::read(&cached).map_err(|e| EditError::ModelLoad(format!("Read {}: {}", file_name, e)))
    }
}

/// A model file name must be a bare `.onnx` name — no path components.
fn validate_model_name(name: &str) -> Result<(), EditError> {
    let p = Path::new(name);
    if name.is_empty()
        || p.components().count() != 1
        || p.extension().and_then(|e| e.to_str()) != Some("onnx")
    {
        return Err(EditError::ModelLoad(format!(
            "Invalid model file name: '{}'",
            name
        )));
    }
    Ok(())
}

// -- Registry -----------------------------------------------------------

/// First load outcome per identity. `Err` is terminal until teardown — the
/// registry never hands out a partially-initialized session.
type LoadOutcome = Result<Arc<dyn InferenceSession>, String>;

/// Dress a recorded load failure up as a user-surfaceable error.
fn load_error(kind: ModelKind, message: String) -> EditError {
    EditError::ModelLoad(format!("{} model unavailable: {}", kind.label(), message))
}

/// Owns every inference session. Explicitly constructed and passed by
/// reference (no global state), supporting clean teardown for tests.
pub struct ModelRegistry {
    backend: Arc<dyn InferenceBackend>,
    assets: ModelAssets,
    specs: HashMap<ModelKind, ModelSpec>,
    slots: [OnceLock<LoadOutcome>; ModelKind::ALL.len()],
    load_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ModelRegistry {
    pub fn new(backend: Arc<dyn InferenceBackend>, assets: ModelAssets) -> Self {
        Self::with_specs(backend, assets, default_specs())
    }

    /// Registry with a custom contract table (e.g. a user-supplied manifest).
    pub fn with_specs(
        backend: Arc<dyn InferenceBackend>,
        assets: ModelAssets,
        specs: HashMap<ModelKind, ModelSpec>,
    ) -> Self {
        ModelRegistry {
            backend,
            assets,
            specs,
            slots: Default::default(),
            load_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// The contract for a model identity.
    pub fn spec(&self, kind: ModelKind) -> Result<&ModelSpec, EditError> {
        self.specs
            .get(&kind)
            .ok_or_else(|| EditError::ModelLoad(format!("No contract for {:?}", kind)))
    }

    /// Get the session for `kind`, loading it on first use. Idempotent and
    /// safe under concurrent calls: the first caller loads and caches, later
    /// callers reuse the cached session without re-loading.
    pub fn acquire(&self, kind: ModelKind) -> Result<Arc<dyn InferenceSession>, EditError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EditError::ModelLoad(
                "Model registry has been released".to_string(),
            ));
        }

        let slot = &self.slots[kind.slot()];
        if let Some(outcome) = slot.get() {
            return outcome.clone().map_err(|m| load_error(kind, m));
        }

        // First load for this identity: serialize against other first-loads.
        let _guard = self.load_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(outcome) = slot.get() {
            return outcome.clone().map_err(|m| load_error(kind, m));
        }

        let outcome = self.load(kind).map_err(|e| e.to_string());
        if let Err(ref msg) = outcome {
            log_warn!("Model {:?} marked failed: {}", kind, msg);
        }
        let _ = slot.set(outcome.clone());
        outcome.map_err(|m| load_error(kind, m))
    }

    /// Eagerly load hot-path models at startup. Load failures are recorded
    /// (and logged) but do not abort startup; the failure will resurface on
    /// first use.
    pub fn preload(&self, kinds: &[ModelKind]) {
        for &kind in kinds {
            if let Err(e) = self.acquire(kind) {
                log_warn!("Preload of {:?} failed: {}", kind, e);
            }
        }
    }

    fn load(&self, kind: ModelKind) -> Result<Arc<dyn InferenceSession>, EditError> {
        let spec = self.spec(kind)?;
        log_info!("Loading model {:?} ({})", kind, spec.file_name);
        let bytes = self.assets.load(&spec.file_name)?;

        match self.backend.create_session(&bytes, &spec.session) {
            Ok(session) => Ok(Arc::from(session)),
            Err(primary) => {
                log_warn!(
                    "Session creation failed for {:?} ({}), retrying with conservative config",
                    kind,
                    primary
                );
                let conservative = ExecutionConfig::conservative();
                match self.backend.create_session(&bytes, &conservative) {
                    Ok(session) => Ok(Arc::from(session)),
                    Err(fallback) => Err(EditError::ModelLoad(format!(
                        "{} (conservative retry: {})",
                        primary, fallback
                    ))),
                }
            }
        }
    }

    /// Whether a model loaded successfully (without triggering a load).
    pub fn is_loaded(&self, kind: ModelKind) -> bool {
        matches!(self.slots[kind.slot()].get(), Some(Ok(_)))
    }

    /// Close every cached session. The registry is not reusable afterwards:
    /// subsequent `acquire` calls fail until a new registry is constructed.
    pub fn release(&mut self) {
        log_info!("Releasing model registry");
        self.closed.store(true, Ordering::Release);
        for slot in &mut self.slots {
            // Dropping the Arc releases the native session once the last
            // in-flight user is done with it.
            let _ = slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingBackend, ScriptedBackend, TempDirs};
    use std::sync::atomic::Ordering;

    fn temp_assets(file_name: &str, contents: &[u8]) -> (TempDirs, ModelAssets) {
        let dirs = TempDirs::new();
        fs::write(dirs.bundle.join(file_name), contents).unwrap();
        let assets = ModelAssets::new(&dirs.bundle, &dirs.cache);
        (dirs, assets)
    }

    #[test]
    fn acquire_is_idempotent() {
        let (_dirs, assets) = temp_assets("u2net.onnx", b"model-bytes");
        let backend = Arc::new(CountingBackend::always_ok());
        let registry = ModelRegistry::new(backend.clone(), assets);

        let a = registry.acquire(ModelKind::Segmentation).unwrap();
        let b = registry.acquire(ModelKind::Segmentation).unwrap();
        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.is_loaded(ModelKind::Segmentation));
    }

    #[test]
    fn falls_back_to_conservative_config() {
        let (_dirs, assets) = temp_assets("u2net.onnx", b"model-bytes");
        let backend = Arc::new(CountingBackend::conservative_only());
        let registry = ModelRegistry::new(backend.clone(), assets);

        registry.acquire(ModelKind::Segmentation).unwrap();
        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 2);
        let used = backend.last_config.lock().unwrap().unwrap();
        assert_eq!(used, ExecutionConfig::conservative());
    }

    #[test]
    fn failure_is_terminal_for_the_identity() {
        let (_dirs, assets) = temp_assets("u2net.onnx", b"model-bytes");
        let backend = Arc::new(CountingBackend::always_fail());
        let registry = ModelRegistry::new(backend.clone(), assets);

        assert!(registry.acquire(ModelKind::Segmentation).is_err());
        assert!(registry.acquire(ModelKind::Segmentation).is_err());
        // Primary + conservative on the first acquire only; the second
        // acquire returns the recorded failure without retrying.
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_asset_is_a_model_load_error() {
        let dirs = TempDirs::new();
        let assets = ModelAssets::new(&dirs.bundle, &dirs.cache);
        let registry = ModelRegistry::new(Arc::new(ScriptedBackend::identity()), assets);
        let err = match registry.acquire(ModelKind::Inpainting) {
            Ok(_) => panic!("expected acquire to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, EditError::ModelLoad(_)));
    }

    #[test]
    fn asset_copy_is_idempotent_and_cached() {
        let (dirs, assets) = temp_assets("lama.onnx", b"v1");
        assert_eq!(assets.load("lama.onnx").unwrap(), b"v1");
        // Changing the bundle after caching must not change what loads.
        fs::write(dirs.bundle.join("lama.onnx"), b"v2-different").unwrap();
        assert_eq!(assets.load("lama.onnx").unwrap(), b"v1");
    }

    #[test]
    fn model_names_with_paths_are_rejected() {
        assert!(validate_model_name("ok_model.onnx").is_ok());
        assert!(validate_model_name("../evil.onnx").is_err());
        assert!(validate_model_name("dir/evil.onnx").is_err());
        assert!(validate_model_name("model.bin").is_err());
        assert!(validate_model_name("").is_err());
    }

    #[test]
    fn release_makes_registry_unusable() {
        let (_dirs, assets) = temp_assets("u2net.onnx", b"model-bytes");
        let mut registry = ModelRegistry::new(Arc::new(CountingBackend::always_ok()), assets);
        registry.acquire(ModelKind::Segmentation).unwrap();
        registry.release();
        assert!(registry.acquire(ModelKind::Segmentation).is_err());
        assert!(!registry.is_loaded(ModelKind::Segmentation));
    }
}
