// ============================================================================
// RetouchFE CLI — headless editing via command-line arguments
// ============================================================================
//
// Usage examples:
//   retouchfe -i photo.png --op enhance -o out.png --runtime /opt/ort/libonnxruntime.so
//   retouchfe -i photo.jpg --op remove-background --threshold 0.6 -o cut.png ...
//   retouchfe -i photo.png --op inpaint --strokes strokes.json -o clean.png ...
//
// No interactive session is created. All processing runs synchronously on
// the current thread against the same pipelines the editor uses.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};

use crate::engine::onnx::OnnxBackend;
use crate::error::EditError;
use crate::io::{load_image, save_image};
use crate::mask::BrushStroke;
use crate::ops::{background, enhance, inpaint, restore};
use crate::registry::{ModelAssets, ModelRegistry, default_specs};
use crate::{log_err, mask};

/// Which edit to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Op {
    /// Tiled super-resolution plus tone/detail boost.
    Enhance,
    /// Face/detail restoration.
    Restore,
    /// Cut the background to transparency.
    RemoveBackground,
    /// Remove the region covered by --strokes.
    Inpaint,
}

/// RetouchFE headless image processor.
///
/// Run neural edits on image files without an interactive session.
#[derive(Parser, Debug)]
#[command(
    name = "retouchfe",
    about = "RetouchFE headless photo editor",
    long_about = "Apply neural photo edits (super-resolution, face restoration,\n\
                  background removal, object inpainting) to image files.\n\n\
                  Example:\n  \
                  retouchfe -i photo.png --op enhance -o out.png \\\n      \
                  --runtime /opt/onnxruntime/libonnxruntime.so --models-dir ./models"
)]
pub struct CliArgs {
    /// Input image file.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output image path (format by extension: png, jpg, webp, bmp).
    #[arg(short, long)]
    pub output: PathBuf,

    /// The edit to apply.
    #[arg(long, value_enum)]
    pub op: Op,

    /// Absolute path to the ONNX Runtime shared library.
    #[arg(long, value_name = "LIB")]
    pub runtime: String,

    /// Directory holding the bundled .onnx model files.
    #[arg(long, value_name = "DIR")]
    pub models_dir: PathBuf,

    /// Writable model cache directory (defaults to a temp subdirectory).
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// JSON manifest overriding entries of the built-in model contract
    /// table (file names, layouts, normalization stats, session configs).
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Foreground threshold for --op remove-background (0–1).
    #[arg(long, default_value_t = 0.5)]
    pub threshold: f32,

    /// JSON stroke file for --op inpaint: a list of
    /// {"points": [[x,y],...], "radius": px, "erase": bool} objects with
    /// normalized coordinates.
    #[arg(long, value_name = "FILE")]
    pub strokes: Option<PathBuf>,

    /// Print per-stage timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Run the requested edit and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    match run_inner(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_err!("CLI run failed: {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_inner(args: &CliArgs) -> Result<(), EditError> {
    let started = Instant::now();

    let backend = OnnxBackend::load(&args.runtime)?;
    if args.verbose {
        println!("ONNX Runtime {}", backend.version());
    }

    let cache_dir = args
        .cache_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("RetouchFE").join("model-cache"));
    let assets = ModelAssets::new(&args.models_dir, cache_dir);

    let specs = match &args.manifest {
        None => default_specs(),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| EditError::Io(format!("Read manifest {}: {}", path.display(), e)))?;
            let overrides: std::collections::HashMap<crate::registry::ModelKind, crate::registry::ModelSpec> =
                serde_json::from_str(&text)
                    .map_err(|e| EditError::Io(format!("Parse manifest: {}", e)))?;
            let mut specs = default_specs();
            specs.extend(overrides);
            specs
        }
    };

    let registry = ModelRegistry::with_specs(Arc::new(backend), assets, specs);

    let input = load_image(&args.input)?;
    if args.verbose {
        println!(
            "Loaded {} ({}x{}) in {:.0?}",
            args.input.display(),
            input.width(),
            input.height(),
            started.elapsed()
        );
    }

    let edit_start = Instant::now();
    let result = match args.op {
        Op::Enhance => {
            let verbose = args.verbose;
            enhance::enhance(&registry, &input, &mut |p| {
                if verbose {
                    println!("  {:3.0}%", p * 100.0);
                }
            })?
        }
        Op::Restore => restore::restore_face(&registry, &input)?,
        Op::RemoveBackground => {
            let (preview, _mask) =
                background::remove_background(&registry, &input, args.threshold)?;
            preview
        }
        Op::Inpaint => {
            let strokes_path = args.strokes.as_ref().ok_or_else(|| {
                EditError::Io("--op inpaint requires --strokes <FILE>".to_string())
            })?;
            let text = std::fs::read_to_string(strokes_path).map_err(|e| {
                EditError::Io(format!("Read strokes {}: {}", strokes_path.display(), e))
            })?;
            let strokes: Vec<BrushStroke> = serde_json::from_str(&text)
                .map_err(|e| EditError::Io(format!("Parse strokes: {}", e)))?;
            if strokes.is_empty() {
                return Err(EditError::Geometry("stroke file is empty".to_string()));
            }
            let rough = mask::rasterize(&strokes, input.width(), input.height());
            inpaint::remove_object(&registry, &input, &rough)?
        }
    };

    if args.verbose {
        println!("Edit completed in {:.1?}", edit_start.elapsed());
    }

    save_image(&result, &args.output)?;
    println!(
        "{} -> {} ({}x{})",
        args.input.display(),
        args.output.display(),
        result.width(),
        result.height()
    );
    Ok(())
}
