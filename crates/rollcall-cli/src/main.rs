use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;
use rollcall_core::attendance::AttendanceLedger;
use rollcall_core::live::{CapturedFrame, FrameSource, FrameSourceError, LiveSession};
use rollcall_core::preprocess::{load_image, Preprocessor};
use rollcall_core::{
    BoundingBox, Checkpoint, CheckpointPaths, Config, DetectionRecord, ErrorKind, FaceLocator,
    LocatorFactory, RecognitionRecord, Recognizer, SampleValidator, ScrfdLocator,
    TrainingOrchestrator,
};
use rollcall_hw::{Camera, FrameStream};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face enrollment and recognition for attendance")]
struct Cli {
    /// TOML config file (defaults to $ROLLCALL_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write annotated debug images
    #[arg(long, global = true)]
    debug_images: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep enrollment photos with exactly one face
    Validate {
        /// Raw photos, one directory per identity
        #[arg(long)]
        source: Option<PathBuf>,
        /// Curated output tree
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Train the recognizer on the curated corpus
    Train {
        #[arg(long)]
        corpus: Option<PathBuf>,
    },
    /// Recognize the largest face in one photo
    Recognize { photo: PathBuf },
    /// Report whether a photo contains a face
    Detect { photo: PathBuf },
    /// Recognize every photo in a directory
    Batch { dir: PathBuf },
    /// Recognize faces from a camera and record attendance
    Live {
        /// Session name stored in the attendance ledger
        #[arg(long, default_value = "session")]
        session: String,
        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.debug_images {
        config.debug_images = true;
    }

    match cli.command {
        Commands::Validate { source, dest } => {
            let source = source.unwrap_or_else(|| config.paths.students_dir.clone());
            let dest = dest.unwrap_or_else(|| config.paths.validated_dir.clone());
            validate(&config, &source, &dest)
        }
        Commands::Train { corpus } => {
            let corpus = corpus.unwrap_or_else(|| config.paths.validated_dir.clone());
            train(&config, &corpus)
        }
        Commands::Recognize { photo } => recognize(&config, &photo),
        Commands::Detect { photo } => detect(&config, &photo),
        Commands::Batch { dir } => batch(&config, &dir),
        Commands::Live { session, max_frames } => live(config, session, max_frames).await,
    }
}

fn locator_factory(config: &Config) -> Arc<LocatorFactory> {
    let model = config.paths.locator_model.clone();
    Arc::new(move || ScrfdLocator::load(&model).map(|l| Box::new(l) as Box<dyn FaceLocator>))
}

fn checkpoint_paths(config: &Config) -> CheckpointPaths {
    CheckpointPaths::new(config.checkpoint_dir(), &config.paths.model_name)
}

fn recognizer(config: &Config) -> Result<Recognizer> {
    let checkpoint: Checkpoint =
        Checkpoint::load(&checkpoint_paths(config)).context("failed to load checkpoint")?;
    let locator = ScrfdLocator::load(&config.paths.locator_model)
        .context("failed to load face locator")?;
    Ok(Recognizer::new(Arc::new(checkpoint), Box::new(locator), config))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn validate(config: &Config, source: &Path, dest: &Path) -> Result<()> {
    let validator = SampleValidator::new(locator_factory(config), config);
    let summary = validator.run(source, dest)?;
    let overall = summary.overall;

    println!("=== Face Validation Summary ===");
    for (identity, counts) in &summary.per_identity {
        println!("  {identity}: {}/{} valid", counts.valid, counts.total);
    }
    println!("Total images processed: {}", overall.total);
    println!("Valid face images: {}", overall.valid);
    println!(
        "Invalid face images: {} (no face {}, multiple {}, unreadable {})",
        overall.invalid(),
        overall.no_face,
        overall.multi_face,
        overall.unreadable
    );
    println!("Validation rate: {:.1}%", overall.validation_rate());
    println!("Valid faces copied to: {}", dest.display());
    Ok(())
}

fn train(config: &Config, corpus: &Path) -> Result<()> {
    let paths = checkpoint_paths(config);
    let orchestrator = TrainingOrchestrator::new(locator_factory(config), config);
    let (_, report) = orchestrator.train(corpus, &paths)?;
    print_json(&report)?;
    println!("Model saved to {} and {}", paths.model.display(), paths.labels.display());
    Ok(())
}

fn recognize(config: &Config, photo: &Path) -> Result<()> {
    let mut recognizer = recognizer(config)?;
    let result = recognizer.recognize_path(photo);
    print_json(&RecognitionRecord::from(&result))?;
    match result {
        Err(e) if e.kind() == ErrorKind::CheckpointMismatch => Err(e.into()),
        _ => Ok(()),
    }
}

fn detect(config: &Config, photo: &Path) -> Result<()> {
    let mut locator = ScrfdLocator::load(&config.paths.locator_model)
        .context("failed to load face locator")?;
    let result = locate_faces(&mut locator, config, photo);
    print_json(&DetectionRecord::from(&result))
}

/// Detection alone, without loading a checkpoint.
fn locate_faces(
    locator: &mut dyn FaceLocator,
    config: &Config,
    photo: &Path,
) -> rollcall_core::Result<Vec<BoundingBox>> {
    let image = load_image(photo)?;
    let gray = Preprocessor::new(config.normalization).prepare(&image);
    Ok(locator.detect(&gray, &config.detection.recognition)?)
}

fn batch(config: &Config, dir: &Path) -> Result<()> {
    let mut photos: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| ["jpg", "jpeg", "png"].iter().any(|x| e.eq_ignore_ascii_case(x)))
        })
        .collect();
    photos.sort();

    let mut recognizer = recognizer(config)?;
    let (mut recognized, mut unknown, mut failed) = (0usize, 0usize, 0usize);
    for photo in &photos {
        let result = recognizer.recognize_path(photo);
        match &result {
            Ok(r) if r.accepted => recognized += 1,
            Ok(_) => unknown += 1,
            Err(e) if e.kind() == ErrorKind::CheckpointMismatch => {
                anyhow::bail!("aborting batch at {}: {e}", photo.display());
            }
            Err(e) => {
                tracing::warn!(photo = %photo.display(), error = %e, "recognition failed");
                failed += 1;
            }
        }
        let record = RecognitionRecord::from(&result);
        println!("{}: {}", photo.display(), serde_json::to_string(&record)?);
    }

    println!("=== Batch Summary ===");
    println!("Photos: {}", photos.len());
    println!("Recognized: {recognized}");
    println!("Unknown: {unknown}");
    println!("Failed: {failed}");
    Ok(())
}

/// Adapts a camera stream to the live session's frame source.
struct CameraSource<'a> {
    stream: FrameStream<'a>,
}

impl FrameSource for CameraSource<'_> {
    fn next_frame(&mut self) -> Result<CapturedFrame, FrameSourceError> {
        let frame = self
            .stream
            .next_frame()
            .map_err(|e| FrameSourceError(e.to_string()))?;
        let image = frame.to_image().ok_or_else(|| {
            FrameSourceError(format!("frame {} has the wrong size", frame.sequence))
        })?;
        Ok(CapturedFrame {
            image,
            sequence: frame.sequence,
            is_dark: frame.is_dark,
        })
    }
}

async fn live(config: Config, session: String, max_frames: Option<usize>) -> Result<()> {
    let recognizer = recognizer(&config)?;
    let roster: Vec<String> = recognizer
        .checkpoint()
        .registry()
        .identities()
        .map(|(_, id)| id.to_string())
        .collect();
    let cancel = Arc::new(AtomicBool::new(false));

    let worker_cancel = Arc::clone(&cancel);
    let mut task = tokio::task::spawn_blocking(move || -> Result<AttendanceLedger> {
        let camera = Camera::open(&config.live.camera_device, config.live.dark_threshold)?;
        let mut stream = camera.stream()?;
        stream.warm_up(config.live.warmup_frames)?;

        let ledger = AttendanceLedger::new(session, Utc::now());
        let mut runner = LiveSession::new(recognizer, ledger, worker_cancel);
        if let Some(max) = max_frames {
            runner = runner.with_max_frames(max);
        }

        let mut source = CameraSource { stream };
        let summary = runner.run(&mut source, |seq, decisions| {
            for d in decisions.iter().filter(|d| d.accepted) {
                println!("frame {seq}: {} ({:.1}%, {:?})", d.identity, d.confidence, d.quality);
            }
        })?;
        println!("{}", serde_json::to_string_pretty(&summary)?);

        let mut ledger = runner.into_ledger();
        let absent = ledger.close(roster.iter().map(String::as_str), Utc::now());
        ledger.save(&config.live.attendance_path)?;
        println!(
            "Attendance: {} present, {} absent, saved to {}",
            ledger.present().count(),
            absent.len(),
            config.live.attendance_path.display()
        );
        Ok(ledger)
    });

    tokio::select! {
        joined = &mut task => {
            joined??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, stopping live session");
            cancel.store(true, Ordering::Relaxed);
            task.await??;
        }
    }
    Ok(())
}
