use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::embedder::crop_face;
use facewatch_core::gallery::{self, Gallery, GalleryError, RejectedRecord};
use facewatch_core::{
    BoundingBox, Embedder, EuclideanMatcher, FaceLocalizer, FacenetEmbedder, GalleryStore, Identity, Matcher,
    Pipeline, RecognitionWorker, ScrfdLocalizer, WorkerConfig, WorkerEvent, DEFAULT_THRESHOLD, DETECTOR_MODEL,
    EMBEDDER_MODEL,
};
use facewatch_hw::{Camera, V4l2Cameras};
use image::RgbImage;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Random ids are drawn from this range.
const ID_RANGE: std::ops::RangeInclusive<u32> = 1..=9999;
const ID_ATTEMPTS: usize = 100;
/// Frames discarded before an enrollment capture.
const WARMUP_FRAMES: usize = 4;

#[derive(Parser)]
#[command(name = "facewatch", about = "Live face recognition against a local gallery")]
struct Cli {
    /// Gallery file (default: $FACEWATCH_GALLERY_PATH or ~/.local/share/facewatch/gallery.json)
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,
    /// Directory holding det_10g.onnx and facenet512.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities
    List,
    /// Enroll the largest face from an image file or a camera frame
    Enroll {
        /// Display name for the identity
        #[arg(short, long)]
        name: String,
        /// Identity id (default: a random unused id in 1..=9999)
        #[arg(long)]
        id: Option<String>,
        /// Read the face from this image instead of a camera
        #[arg(long, conflicts_with = "camera")]
        image: Option<PathBuf>,
        /// Camera index to capture from
        #[arg(long, default_value_t = 0)]
        camera: u32,
        /// Drop malformed gallery records instead of refusing to rewrite the file
        #[arg(long)]
        prune: bool,
    },
    /// Remove an identity from the gallery
    Remove {
        /// Identity id to remove
        id: String,
        /// Drop malformed gallery records instead of refusing to rewrite the file
        #[arg(long)]
        prune: bool,
    },
    /// Identify every face in a still image
    Identify {
        image: PathBuf,
        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f32,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run live recognition in the foreground until Ctrl-C
    Watch {
        #[arg(long, default_value_t = 0)]
        camera: u32,
        #[arg(long, default_value_t = 1)]
        fallback: u32,
        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let gallery_path = cli
        .gallery
        .or_else(|| std::env::var_os("FACEWATCH_GALLERY_PATH").map(PathBuf::from))
        .unwrap_or_else(facewatch_core::default_gallery_path);
    let model_dir = cli
        .model_dir
        .or_else(|| std::env::var_os("FACEWATCH_MODEL_DIR").map(PathBuf::from))
        .unwrap_or_else(facewatch_core::default_model_dir);

    match cli.command {
        Commands::List => {
            let identities = read_gallery(&gallery_path)?;
            if identities.is_empty() {
                println!("No identities enrolled ({})", gallery_path.display());
            }
            for identity in &identities {
                println!("{:>6}  {}  [{}-d]", identity.id, identity.name, identity.embedding.dimension());
            }
        }
        Commands::Enroll { name, id, image, camera, prune } => {
            let frame = match image {
                Some(path) => open_image(&path)?,
                None => {
                    let mut cam = Camera::open(camera).with_context(|| format!("failed to open camera {camera}"))?;
                    cam.capture_settled(WARMUP_FRAMES).context("failed to capture frame")?
                }
            };

            let (mut localizer, mut embedder) = load_models(&model_dir)?;
            let faces = localizer.locate(&frame).context("face detection failed")?;
            let Some(face) = largest_face(&faces) else {
                bail!("no face detected");
            };
            let crop = crop_face(&frame, face).context("detected face lies outside the frame")?;
            let embedding = embedder.embed(&crop).context("face embedding failed")?;

            let mut identities = editable_gallery(&gallery_path, prune)?;
            let current = Gallery::from_identities(identities.clone()).context("gallery file is inconsistent")?;
            if let Some(dimension) = current.dimension() {
                if dimension != embedding.dimension() {
                    bail!(
                        "embedding has dimension {}, gallery uses {dimension}",
                        embedding.dimension()
                    );
                }
            }
            let id = match id {
                Some(id) if current.contains_id(&id) => bail!("id {id} is already enrolled"),
                Some(id) => id,
                None => assign_id(&current, &mut rand::thread_rng())
                    .context("no free id found, pass one with --id")?,
            };

            let identity = Identity::new(id, name, embedding);
            println!("Enrolled {} (confidence {:.2})", identity.display_label(), face.confidence);
            identities.push(identity);
            gallery::save(&gallery_path, &identities)?;
            tracing::info!(path = %gallery_path.display(), identities = identities.len(), "gallery saved");
            println!("Send SIGHUP to facewatchd to pick up the change");
        }
        Commands::Remove { id, prune } => {
            let mut identities = editable_gallery(&gallery_path, prune)?;
            let before = identities.len();
            identities.retain(|identity| identity.id != id);
            if identities.len() == before {
                bail!("no identity with id {id}");
            }
            gallery::save(&gallery_path, &identities)?;
            tracing::info!(path = %gallery_path.display(), identities = identities.len(), "gallery saved");
            println!("Removed {id}");
        }
        Commands::Identify { image, threshold } => {
            let frame = open_image(&image)?;
            let store = GalleryStore::open(gallery_path.clone());
            if store.size().is_none() {
                bail!("failed to load gallery {}", gallery_path.display());
            }
            let gallery = store.snapshot();

            let (mut localizer, mut embedder) = load_models(&model_dir)?;
            let faces = localizer.locate(&frame).context("face detection failed")?;
            if faces.is_empty() {
                println!("No faces detected");
            }
            for (n, face) in faces.iter().enumerate() {
                let Some(crop) = crop_face(&frame, face) else {
                    continue;
                };
                let embedding = embedder.embed(&crop).context("face embedding failed")?;
                let result = EuclideanMatcher.classify(&embedding, &gallery, threshold);
                let label = result
                    .identity
                    .as_ref()
                    .map_or_else(|| "Unknown".to_string(), Identity::display_label);
                println!(
                    "face {n} at ({:.0}, {:.0}, {:.0}x{:.0}): {label} d:{:.3}",
                    face.x, face.y, face.width, face.height, result.distance
                );
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{:>2}  {}  {} ({}, {})", dev.index, dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Watch { camera, fallback, threshold } => {
            watch(gallery_path, &model_dir, camera, fallback, threshold).await?;
        }
    }

    Ok(())
}

async fn watch(gallery_path: PathBuf, model_dir: &Path, camera: u32, fallback: u32, threshold: f32) -> Result<()> {
    let (localizer, embedder) = load_models(model_dir)?;
    let config = WorkerConfig {
        primary_device: camera,
        fallback_device: fallback,
        threshold,
        ..WorkerConfig::default()
    };
    let worker = Arc::new(RecognitionWorker::new(
        config,
        Arc::new(V4l2Cameras),
        Pipeline::new(localizer, embedder),
        Arc::new(GalleryStore::open(gallery_path)),
    ));
    let mut events = worker.subscribe().context("event stream already taken")?;

    let starter = Arc::clone(&worker);
    tokio::task::spawn_blocking(move || starter.start())
        .await?
        .context("failed to start recognition")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(WorkerEvent::Frame(_)) => {}
                Some(WorkerEvent::Matched { id, name, distance, .. }) => println!("{name} ({id}) d:{distance:.3}"),
                Some(WorkerEvent::Unmatched) => println!("no match"),
                Some(WorkerEvent::Error(message)) => eprintln!("error: {message}"),
                Some(WorkerEvent::GalleryLoaded(count)) => println!("gallery: {count} identities"),
                None => break,
            },
        }
    }

    let stopper = Arc::clone(&worker);
    tokio::task::spawn_blocking(move || stopper.stop()).await?;
    Ok(())
}

fn load_models(model_dir: &Path) -> Result<(ScrfdLocalizer, FacenetEmbedder)> {
    let detector_path = model_dir.join(DETECTOR_MODEL);
    let embedder_path = model_dir.join(EMBEDDER_MODEL);
    let localizer = ScrfdLocalizer::load(&detector_path.to_string_lossy()).context("failed to load face detection model")?;
    let embedder = FacenetEmbedder::load(&embedder_path.to_string_lossy()).context("failed to load face embedding model")?;
    Ok((localizer, embedder))
}

fn open_image(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8())
}

/// Valid identities on disk plus the records that failed validation. A
/// missing file is an empty gallery.
fn load_records(path: &Path) -> Result<(Vec<Identity>, Vec<RejectedRecord>)> {
    match gallery::load(path) {
        Ok(report) => Ok((report.gallery.identities().to_vec(), report.rejected)),
        Err(GalleryError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            Ok((Vec::new(), Vec::new()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Identities for read-only use; malformed records are logged and left out.
fn read_gallery(path: &Path) -> Result<Vec<Identity>> {
    let (identities, rejected) = load_records(path)?;
    for record in &rejected {
        tracing::warn!(index = record.index, error = %record.error, "skipping malformed gallery record");
    }
    Ok(identities)
}

/// Identities about to be written back. Saving would drop malformed records,
/// so that only happens with `prune`.
fn editable_gallery(path: &Path, prune: bool) -> Result<Vec<Identity>> {
    let (identities, rejected) = load_records(path)?;
    if rejected.is_empty() {
        return Ok(identities);
    }
    if !prune {
        let indices: Vec<String> = rejected.iter().map(|r| r.index.to_string()).collect();
        bail!(
            "{} has {} malformed record(s) (index {}); fix them or pass --prune to drop them",
            path.display(),
            rejected.len(),
            indices.join(", ")
        );
    }
    for record in &rejected {
        tracing::warn!(index = record.index, error = %record.error, "pruning malformed gallery record");
    }
    Ok(identities)
}

/// The face with the largest box area; the first one on ties.
fn largest_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces
        .iter()
        .fold(None, |best: Option<&BoundingBox>, face| match best {
            Some(best) if best.area() >= face.area() => Some(best),
            _ => Some(face),
        })
}

/// Pick a random id in 1..=9999 not already in `gallery`.
fn assign_id(gallery: &Gallery, rng: &mut impl Rng) -> Option<String> {
    (0..ID_ATTEMPTS)
        .map(|_| rng.gen_range(ID_RANGE).to_string())
        .find(|id| !gallery.contains_id(id))
}
