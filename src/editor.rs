// ============================================================================
// Editor — control-thread state, background jobs, debounced auto-refine
// ============================================================================
//
// A single foreground control thread owns all mutable editor state. Every
// O(pixels) transformation and every inference call runs on the worker pool
// (`rayon::spawn`) and posts its result back over a channel; `poll()` applies
// results on the control thread. Hence:
//
//   * stroke events mutate the stroke list synchronously, in arrival order;
//   * history pushes happen in completion order, on the control thread;
//   * at most one image-mutating operation is in flight at a time;
//   * a debounced auto-refine re-arms its deadline on every new stroke and
//     stamps the in-flight run with a generation counter — results whose
//     generation no longer matches are discarded, not applied.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use image::{GrayImage, RgbaImage, imageops};

use crate::history::SnapshotHistory;
use crate::mask::BrushStroke;
use crate::ops::refine::RefineOutcome;
use crate::ops::{background, enhance, inpaint, refine, restore};
use crate::registry::{ModelKind, ModelRegistry};
use crate::{log_err, log_info, log_warn, mask};

/// Working-resolution cap applied when an image is loaded; resource
/// exhaustion is prevented up front rather than caught inside a pipeline.
const MAX_LOAD_DIM: u32 = 4096;

/// Stroke inactivity before the auto-refine fires.
const DEFAULT_REFINE_DELAY: Duration = Duration::from_millis(1200);

/// User intents consumed by the editor.
#[derive(Debug)]
pub enum EditorAction {
    LoadImage(RgbaImage),
    AddStroke(BrushStroke),
    ClearStrokes,
    /// Refine the stroke mask now, without waiting for the debounce.
    RefineMask,
    RemoveObject,
    RemoveBackground { threshold: f32 },
    RestoreFace,
    EnhancePhoto,
    Undo,
    Redo,
    ClearError,
}

/// UI-facing state. The embedding application renders from this; the core
/// never draws anything itself.
#[derive(Default)]
pub struct EditorState {
    pub current_image: Option<RgbaImage>,
    pub is_processing: bool,
    pub processing_message: String,
    pub progress: f32,
    pub error: Option<String>,
    pub can_undo: bool,
    pub can_redo: bool,
    /// Latest neural refinement of the current stroke mask, if any.
    pub refined_mask: Option<GrayImage>,
}

/// Results posted back from worker jobs.
enum JobResult {
    Progress(f32),
    Refined {
        generation: u64,
        outcome: RefineOutcome,
    },
    Edited {
        label: &'static str,
        result: Result<RgbaImage, String>,
    },
}

struct PendingRefine {
    deadline: Instant,
    generation: u64,
}

pub struct Editor {
    state: EditorState,
    history: SnapshotHistory,
    registry: Arc<ModelRegistry>,
    strokes: Vec<BrushStroke>,
    /// Bumped on every stroke-set change; stamps refine runs.
    stroke_generation: u64,
    pending_refine: Option<PendingRefine>,
    refine_in_flight: bool,
    refine_delay: Duration,
    job_sender: mpsc::Sender<JobResult>,
    job_receiver: mpsc::Receiver<JobResult>,
}

impl Editor {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        let (job_sender, job_receiver) = mpsc::channel();
        Editor {
            state: EditorState::default(),
            history: SnapshotHistory::default(),
            registry,
            strokes: Vec::new(),
            stroke_generation: 0,
            pending_refine: None,
            refine_in_flight: false,
            refine_delay: DEFAULT_REFINE_DELAY,
            job_sender,
            job_receiver,
        }
    }

    /// Override the auto-refine debounce interval.
    pub fn with_refine_delay(mut self, delay: Duration) -> Self {
        self.refine_delay = delay;
        self
    }

    /// Kick off eager loading of the hot-path models on the worker pool so
    /// the first restoration/segmentation request does not pay the load.
    pub fn preload_hot_models(&self) {
        let registry = Arc::clone(&self.registry);
        rayon::spawn(move || {
            registry.preload(&[ModelKind::FaceRestoration, ModelKind::Segmentation]);
        });
    }

    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn strokes(&self) -> &[BrushStroke] {
        &self.strokes
    }

    /// Apply a user intent. Must be called from the control thread.
    pub fn handle_action(&mut self, action: EditorAction) {
        match action {
            EditorAction::LoadImage(image) => self.load_image(image),
            EditorAction::AddStroke(stroke) => self.add_stroke(stroke),
            EditorAction::ClearStrokes => self.clear_strokes(),
            EditorAction::RefineMask => self.trigger_refine(),
            EditorAction::RemoveObject => self.remove_object(),
            EditorAction::RemoveBackground { threshold } => self.remove_background(threshold),
            EditorAction::RestoreFace => self.restore_face(),
            EditorAction::EnhancePhoto => self.enhance_photo(),
            EditorAction::Undo => self.undo(),
            EditorAction::Redo => self.redo(),
            EditorAction::ClearError => self.state.error = None,
        }
    }

    /// Pump worker results and fire the debounced refine. Call regularly
    /// from the control thread (e.g. once per UI frame).
    pub fn poll(&mut self) {
        // Debounce: fire once the deadline passes with no newer stroke.
        let due = match &self.pending_refine {
            Some(p) if Instant::now() >= p.deadline && !self.refine_in_flight => {
                Some(p.generation)
            }
            _ => None,
        };
        if let Some(generation) = due {
            self.pending_refine = None;
            self.spawn_refine(generation);
        }

        while let Ok(result) = self.job_receiver.try_recv() {
            match result {
                JobResult::Progress(p) => {
                    self.state.progress = p;
                }
                JobResult::Refined {
                    generation,
                    outcome,
                } => {
                    self.refine_in_flight = false;
                    if generation != self.stroke_generation {
                        // Strokes moved on while this run was in flight.
                        log_info!(
                            "Discarding stale refine result (gen {} != {})",
                            generation,
                            self.stroke_generation
                        );
                        continue;
                    }
                    if let RefineOutcome::RoughFallback { error, .. } = &outcome {
                        log_warn!("Refine fell back to the rough mask: {}", error);
                    }
                    self.state.refined_mask = Some(outcome.into_mask());
                }
                JobResult::Edited { label, result } => {
                    self.state.is_processing = false;
                    self.state.processing_message.clear();
                    match result {
                        Ok(image) => {
                            self.state.current_image = Some(image.clone());
                            self.history.push(image);
                            self.sync_history_flags();
                        }
                        Err(msg) => {
                            log_err!("{} failed: {}", label, msg);
                            self.state.error = Some(format!("Failed to {}: {}", label, msg));
                        }
                    }
                }
            }
        }
    }

    /// Tear down: close every model session. The editor is not usable for
    /// further inference afterwards.
    pub fn shutdown(&mut self) {
        if let Some(registry) = Arc::get_mut(&mut self.registry) {
            registry.release();
        } else {
            log_warn!("Registry still shared at shutdown; sessions close with the last owner");
        }
    }

    // -- Action handlers ------------------------------------------------

    fn load_image(&mut self, image: RgbaImage) {
        let image = cap_resolution(image, MAX_LOAD_DIM);
        self.state.current_image = Some(image.clone());
        self.state.error = None;
        self.strokes.clear();
        self.state.refined_mask = None;
        self.stroke_generation += 1;
        self.pending_refine = None;
        self.history.push(image);
        self.sync_history_flags();
    }

    fn add_stroke(&mut self, stroke: BrushStroke) {
        // Strokes apply in strict arrival order; the generation bump
        // invalidates any refine captured against the old stroke set and
        // re-arms the debounce timer.
        self.strokes.push(stroke);
        self.stroke_generation += 1;
        self.pending_refine = Some(PendingRefine {
            deadline: Instant::now() + self.refine_delay,
            generation: self.stroke_generation,
        });
    }

    fn clear_strokes(&mut self) {
        self.strokes.clear();
        self.stroke_generation += 1;
        self.pending_refine = None;
        self.state.refined_mask = None;
    }

    fn trigger_refine(&mut self) {
        self.pending_refine = None;
        if !self.refine_in_flight {
            self.spawn_refine(self.stroke_generation);
        }
    }

    fn spawn_refine(&mut self, generation: u64) {
        let Some(image) = self.state.current_image.clone() else {
            return;
        };
        if self.strokes.is_empty() {
            self.state.refined_mask = None;
            return;
        }
        self.refine_in_flight = true;

        let strokes = self.strokes.clone();
        let registry = Arc::clone(&self.registry);
        let sender = self.job_sender.clone();
        rayon::spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let (w, h) = image.dimensions();
                let rough = mask::rasterize(&strokes, w, h);
                refine::refine_mask(&registry, &image, &rough)
            }))
            .unwrap_or_else(|_| {
                let (w, h) = image.dimensions();
                RefineOutcome::RoughFallback {
                    mask: mask::rasterize(&strokes, w, h),
                    error: crate::EditError::Inference("refine worker panicked".to_string()),
                }
            });
            let _ = sender.send(JobResult::Refined {
                generation,
                outcome,
            });
        });
    }

    fn remove_object(&mut self) {
        let Some(image) = self.current_for_edit("remove the object") else {
            return;
        };
        if self.strokes.is_empty() && self.state.refined_mask.is_none() {
            self.state.error = Some("Draw over the object to remove first".to_string());
            return;
        }

        let strokes = self.strokes.clone();
        let refined = self.state.refined_mask.clone();
        let registry = Arc::clone(&self.registry);
        self.begin_processing("Removing object...");
        self.spawn_edit("remove object", move || {
            let (w, h) = image.dimensions();
            let mask_full = match refined {
                Some(m) if m.dimensions() == (w, h) => m,
                _ => mask::rasterize(&strokes, w, h),
            };
            inpaint::remove_object(&registry, &image, &mask_full).map_err(|e| e.to_string())
        });
        // The consumed strokes no longer describe anything on the new image.
        self.clear_strokes();
    }

    fn remove_background(&mut self, threshold: f32) {
        let Some(image) = self.current_for_edit("remove the background") else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        self.begin_processing("Processing background...");
        self.spawn_edit("remove background", move || {
            background::remove_background(&registry, &image, threshold)
                .map(|(preview, _mask)| preview)
                .map_err(|e| e.to_string())
        });
    }

    fn restore_face(&mut self) {
        let Some(image) = self.current_for_edit("restore faces") else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        self.begin_processing("Restoring faces...");
        self.spawn_edit("restore faces", move || {
            restore::restore_face(&registry, &image).map_err(|e| e.to_string())
        });
    }

    fn enhance_photo(&mut self) {
        let Some(image) = self.current_for_edit("enhance the photo") else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let progress_sender = self.job_sender.clone();
        self.begin_processing("Enhancing photo...");
        self.spawn_edit("enhance photo", move || {
            enhance::enhance(&registry, &image, &mut |p| {
                let _ = progress_sender.send(JobResult::Progress(p));
            })
            .map_err(|e| e.to_string())
        });
    }

    fn undo(&mut self) {
        if self.state.is_processing {
            log_warn!("Undo ignored while an operation is in flight");
            return;
        }
        if let Some(image) = self.history.undo() {
            self.state.current_image = Some(image.clone());
            self.sync_history_flags();
        }
    }

    fn redo(&mut self) {
        if self.state.is_processing {
            log_warn!("Redo ignored while an operation is in flight");
            return;
        }
        if let Some(image) = self.history.redo() {
            self.state.current_image = Some(image.clone());
            self.sync_history_flags();
        }
    }

    // -- Job plumbing ---------------------------------------------------

    /// Current image for an image-mutating operation, or None (with the
    /// reason surfaced) when the edit cannot start.
    fn current_for_edit(&mut self, what: &str) -> Option<RgbaImage> {
        if self.state.is_processing {
            log_warn!("Ignoring request to {} while another operation runs", what);
            return None;
        }
        let image = self.state.current_image.clone();
        if image.is_none() {
            self.state.error = Some("No image loaded".to_string());
        }
        image
    }

    fn begin_processing(&mut self, message: &str) {
        self.state.is_processing = true;
        self.state.processing_message = message.to_string();
        self.state.progress = 0.0;
        self.state.error = None;
    }

    /// Run an image edit on the worker pool; the result (or panic) comes
    /// back through the channel in completion order.
    fn spawn_edit(
        &mut self,
        label: &'static str,
        job: impl FnOnce() -> Result<RgbaImage, String> + Send + 'static,
    ) {
        let sender = self.job_sender.clone();
        rayon::spawn(move || {
            let result = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(r) => r,
                Err(payload) => {
                    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic payload".to_string()
                    };
                    Err(format!("worker panicked: {}", msg))
                }
            };
            let _ = sender.send(JobResult::Edited { label, result });
        });
    }

    fn sync_history_flags(&mut self) {
        self.state.can_undo = self.history.can_undo();
        self.state.can_redo = self.history.can_redo();
    }
}

/// Downscale (preserving aspect) so neither dimension exceeds `max_dim`.
fn cap_resolution(image: RgbaImage, max_dim: u32) -> RgbaImage {
    let (w, h) = image.dimensions();
    if w <= max_dim && h <= max_dim {
        return image;
    }
    let scale = max_dim as f32 / w.max(h) as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    log_info!("Capping loaded image {}x{} -> {}x{}", w, h, nw, nh);
    imageops::resize(&image, nw, nh, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Tensor;
    use crate::registry::ModelKind;
    use crate::testing::{RunFn, mock_registry};
    use image::Rgba;
    use std::collections::HashMap;
    use std::time::Duration;

    fn tagged(tag: u8, w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([tag, 0, 0, 255]))
    }

    /// Poll until `done` returns true or the timeout expires.
    fn poll_until(editor: &mut Editor, timeout: Duration, mut done: impl FnMut(&Editor) -> bool) {
        let deadline = Instant::now() + timeout;
        loop {
            editor.poll();
            if done(editor) {
                return;
            }
            if Instant::now() > deadline {
                panic!("poll_until timed out");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn constant_inpaint_session() -> RunFn {
        std::sync::Arc::new(|inputs: &[(&str, &Tensor)]| {
            let (_, image) = inputs.iter().find(|(n, _)| *n == "image").unwrap();
            let (h, w) = image.spatial_dims().unwrap();
            let mut out = HashMap::new();
            out.insert(
                "output".to_string(),
                Tensor::f32(vec![1, 3, h as i64, w as i64], vec![0.5; 3 * (h * w) as usize]),
            );
            Ok(out)
        })
    }

    #[test]
    fn load_undo_redo_flow() {
        let (_dirs, registry) = mock_registry(vec![]);
        let mut editor = Editor::new(Arc::new(registry));

        editor.handle_action(EditorAction::LoadImage(tagged(1, 16, 16)));
        assert!(!editor.state().can_undo);

        // A completed edit pushes in completion order; simulate by loading
        // two more images (each load pushes a snapshot).
        editor.handle_action(EditorAction::LoadImage(tagged(2, 16, 16)));
        editor.handle_action(EditorAction::LoadImage(tagged(3, 16, 16)));
        assert!(editor.state().can_undo);

        editor.handle_action(EditorAction::Undo);
        assert_eq!(editor.state().current_image.as_ref().unwrap().get_pixel(0, 0)[0], 2);
        editor.handle_action(EditorAction::Redo);
        assert_eq!(editor.state().current_image.as_ref().unwrap().get_pixel(0, 0)[0], 3);
    }

    #[test]
    fn oversized_loads_are_capped() {
        let (_dirs, registry) = mock_registry(vec![]);
        let mut editor = Editor::new(Arc::new(registry));
        editor.handle_action(EditorAction::LoadImage(tagged(1, 8192, 4096)));
        let img = editor.state().current_image.as_ref().unwrap();
        assert_eq!(img.dimensions(), (4096, 2048));
    }

    #[test]
    fn remove_object_completes_and_pushes_history() {
        let (_dirs, registry) =
            mock_registry(vec![(ModelKind::Inpainting, constant_inpaint_session())]);
        let mut editor = Editor::new(Arc::new(registry));
        editor.handle_action(EditorAction::LoadImage(tagged(10, 32, 32)));
        editor.handle_action(EditorAction::AddStroke(BrushStroke::new(
            vec![[0.5, 0.5]],
            8.0,
            false,
        )));
        editor.handle_action(EditorAction::RemoveObject);
        assert!(editor.state().is_processing);

        poll_until(&mut editor, Duration::from_secs(10), |e| {
            !e.state().is_processing
        });
        assert!(editor.state().error.is_none(), "{:?}", editor.state().error);
        assert!(editor.state().can_undo);
        // Masked center replaced by the model's constant fill.
        let img = editor.state().current_image.as_ref().unwrap();
        assert!((img.get_pixel(16, 16)[0] as i16 - 128).abs() <= 1);
        // Unmasked corner untouched.
        assert_eq!(img.get_pixel(1, 1)[0], 10);
    }

    #[test]
    fn failed_edit_surfaces_error_and_preserves_image() {
        // No inpainting model registered → model-load failure inside the job.
        let (_dirs, registry) = mock_registry(vec![]);
        let mut editor = Editor::new(Arc::new(registry));
        editor.handle_action(EditorAction::LoadImage(tagged(9, 16, 16)));
        editor.handle_action(EditorAction::AddStroke(BrushStroke::new(
            vec![[0.5, 0.5]],
            4.0,
            false,
        )));
        editor.handle_action(EditorAction::RemoveObject);

        poll_until(&mut editor, Duration::from_secs(10), |e| {
            !e.state().is_processing
        });
        assert!(editor.state().error.is_some());
        // Pre-operation image intact, no history entry added.
        assert_eq!(editor.state().current_image.as_ref().unwrap().get_pixel(0, 0)[0], 9);
        assert!(!editor.state().can_undo);
    }

    #[test]
    fn second_edit_is_rejected_while_one_runs() {
        let (_dirs, registry) =
            mock_registry(vec![(ModelKind::Inpainting, constant_inpaint_session())]);
        let mut editor = Editor::new(Arc::new(registry));
        editor.handle_action(EditorAction::LoadImage(tagged(1, 32, 32)));
        editor.handle_action(EditorAction::AddStroke(BrushStroke::new(
            vec![[0.5, 0.5]],
            8.0,
            false,
        )));
        editor.handle_action(EditorAction::RemoveObject);
        assert!(editor.state().is_processing);
        // While busy, a second mutating request is ignored outright.
        editor.handle_action(EditorAction::RestoreFace);
        poll_until(&mut editor, Duration::from_secs(10), |e| {
            !e.state().is_processing
        });
        // Only the inpaint result landed: exactly one undoable step.
        assert!(editor.state().can_undo);
        editor.handle_action(EditorAction::Undo);
        assert!(!editor.state().can_undo);
    }

    #[test]
    fn stale_refine_results_are_discarded() {
        // Encoder/decoder that produce a full-positive mask.
        let encoder: RunFn = std::sync::Arc::new(|_inputs| {
            let mut out = HashMap::new();
            out.insert(
                "image_embeddings".to_string(),
                Tensor::f32(vec![1, 256, 64, 64], vec![0.0; 256 * 64 * 64]),
            );
            Ok(out)
        });
        let decoder: RunFn = std::sync::Arc::new(|_inputs| {
            let g = 256usize;
            let mut out = HashMap::new();
            out.insert(
                "masks".to_string(),
                Tensor::f32(vec![1, 1, 256, 256], vec![8.0; g * g]),
            );
            Ok(out)
        });
        let (_dirs, registry) = mock_registry(vec![
            (ModelKind::SamEncoder, encoder),
            (ModelKind::SamDecoder, decoder),
        ]);

        let mut editor =
            Editor::new(Arc::new(registry)).with_refine_delay(Duration::from_millis(0));
        editor.handle_action(EditorAction::LoadImage(tagged(1, 64, 64)));
        editor.handle_action(EditorAction::AddStroke(BrushStroke::new(
            vec![[0.5, 0.5]],
            10.0,
            false,
        )));

        // Fire the debounced refine...
        editor.poll();
        // ...and move the stroke set on before the result lands.
        editor.handle_action(EditorAction::AddStroke(BrushStroke::new(
            vec![[0.2, 0.2]],
            10.0,
            false,
        )));

        // The first (stale) result must be discarded; the re-armed refine
        // for the new generation eventually lands.
        poll_until(&mut editor, Duration::from_secs(20), |e| {
            e.state().refined_mask.is_some()
        });
        assert!(editor.state().refined_mask.is_some());
    }

    #[test]
    fn debounce_rearms_on_new_strokes() {
        let (_dirs, registry) = mock_registry(vec![]);
        let mut editor =
            Editor::new(Arc::new(registry)).with_refine_delay(Duration::from_secs(3600));
        editor.handle_action(EditorAction::LoadImage(tagged(1, 16, 16)));
        editor.handle_action(EditorAction::AddStroke(BrushStroke::new(
            vec![[0.5, 0.5]],
            4.0,
            false,
        )));
        let first_gen = editor.pending_refine.as_ref().unwrap().generation;
        editor.handle_action(EditorAction::AddStroke(BrushStroke::new(
            vec![[0.6, 0.6]],
            4.0,
            false,
        )));
        let second = editor.pending_refine.as_ref().unwrap();
        assert!(second.generation > first_gen);
        // Far-future deadline: poll must not fire it.
        editor.poll();
        assert!(!editor.refine_in_flight);
    }
}
