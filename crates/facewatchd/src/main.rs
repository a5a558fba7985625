use anyhow::{Context, Result};
use facewatch_core::{FacenetEmbedder, GalleryStore, Pipeline, RecognitionWorker, ScrfdLocalizer};
use facewatch_hw::V4l2Cameras;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod config;
mod publish;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    tracing::info!(
        gallery = %config.gallery_path.display(),
        model_dir = %config.model_dir.display(),
        camera = config.camera_index,
        fallback = config.fallback_camera_index,
        threshold = config.threshold,
        "facewatchd starting"
    );

    let gallery = Arc::new(GalleryStore::open(config.gallery_path.clone()));
    match gallery.size() {
        Some(count) => tracing::info!(identities = count, "gallery loaded"),
        None => tracing::warn!("gallery could not be loaded, starting with no identities"),
    }

    let localizer =
        ScrfdLocalizer::load(&config.detector_model_path()).context("failed to load face detection model")?;
    let embedder =
        FacenetEmbedder::load(&config.embedder_model_path()).context("failed to load face embedding model")?;

    let worker = Arc::new(RecognitionWorker::new(
        config.worker_config(),
        Arc::new(V4l2Cameras),
        Pipeline::new(localizer, embedder),
        gallery,
    ));
    let events = worker.subscribe().context("event stream already taken")?;
    let publisher = tokio::spawn(publish::run(events));

    // start/stop open and join OS resources; keep them off the async workers.
    let started = {
        let worker = Arc::clone(&worker);
        tokio::task::spawn_blocking(move || worker.start()).await?
    };
    if let Err(e) = started {
        drop(worker);
        publisher.await?;
        return Err(e).context("failed to start recognition worker");
    }

    tracing::info!("facewatchd ready");

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading gallery");
                let worker = Arc::clone(&worker);
                match tokio::task::spawn_blocking(move || worker.reload_gallery()).await? {
                    Ok(summary) => tracing::info!(
                        identities = summary.loaded,
                        generation = summary.generation,
                        rejected = summary.rejected.len(),
                        "gallery reloaded"
                    ),
                    Err(e) => tracing::warn!(error = %e, "gallery reload failed"),
                }
            }
        }
    }

    tracing::info!("facewatchd shutting down");
    {
        let worker = Arc::clone(&worker);
        tokio::task::spawn_blocking(move || worker.stop()).await?;
    }
    // Last sender goes with the worker; the publisher drains and exits.
    drop(worker);
    publisher.await?;

    Ok(())
}
