mod api;
mod assets;
mod cache;
mod catalog;
mod config;
mod hotspots;
mod media;
mod playback;
mod realtime;
mod renderer;
mod tour;
mod video;

use crate::api::{HttpDataSource, HttpMediaFetcher, TourDataSource};
use crate::assets::{PreloadTiming, Preloader};
use crate::cache::MediaCache;
use crate::config::Settings;
use crate::media::{DecodeProbe, MediaFetcher, SinkFactory};
use crate::realtime::RealtimeEvent;
use crate::renderer::{Renderer, SurfaceInput};
use crate::tour::{EngineCommand, EngineHandle, TourEngine};
use crate::video::{GstProbe, GstSinkFactory};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load()?;
    tracing::info!("Starting tour viewer against {}", settings.backend_url);

    video::init_backend()?;

    let cache = Arc::new(MediaCache::new(
        settings.cache_dir.clone(),
        settings.cache_max_gb,
    )?);
    let client = reqwest::Client::new();
    let data: Arc<dyn TourDataSource> = Arc::new(HttpDataSource::new(
        client.clone(),
        settings.backend_url.clone(),
        settings.device_id.clone(),
    ));
    let fetcher: Arc<dyn MediaFetcher> = Arc::new(HttpMediaFetcher::new(client));
    let prober: Arc<dyn DecodeProbe> = Arc::new(GstProbe);
    let preloader = Arc::new(Preloader::new(
        fetcher,
        prober,
        cache.clone(),
        PreloadTiming::default(),
    ));
    let sinks: Arc<dyn SinkFactory> = Arc::new(GstSinkFactory);

    let (engine, handle) = TourEngine::new(data, sinks, preloader, cache, &settings)?;
    let engine_task = tokio::spawn(engine.run());

    // Backend edits reach running viewers as reload commands.
    let mut realtime_rx = realtime::spawn_realtime(settings.backend_url.clone());
    let realtime_commands = handle.commands.clone();
    tokio::spawn(async move {
        while let Some(event) = realtime_rx.recv().await {
            if let RealtimeEvent::ContentChanged { house_id } = event {
                tracing::debug!("Content changed (house {:?})", house_id);
                let _ = realtime_commands.send(EngineCommand::Reload).await;
            }
        }
    });

    let signal_commands = handle.commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_commands.send(EngineCommand::Shutdown).await;
        }
    });

    handle
        .commands
        .send(EngineCommand::SwitchHouse(settings.initial_house))
        .await
        .context("Engine stopped before startup")?;

    run_surface(&handle).await?;

    let _ = handle.commands.send(EngineCommand::Shutdown).await;
    engine_task.await??;
    Ok(())
}

/// Drive the render/input surface until the user quits.
async fn run_surface(handle: &EngineHandle) -> Result<()> {
    let mut renderer = Renderer::new().context("Failed to create render surface")?;
    let (width, height) = renderer.screen_size();
    handle
        .commands
        .send(EngineCommand::ViewportResized { width, height })
        .await
        .ok();
    let texture_creator = renderer.texture_creator();
    let mut status = handle.status.clone();

    loop {
        for input in renderer.poll_inputs() {
            let command = match input {
                SurfaceInput::Quit => return Ok(()),
                SurfaceInput::Click { x, y } => EngineCommand::PointerClick { x, y },
                SurfaceInput::Move { x, y } => EngineCommand::PointerMove { x, y },
                SurfaceInput::Back => EngineCommand::Back,
                SurfaceInput::House(house_id) => EngineCommand::SwitchHouse(house_id),
            };
            if handle.commands.send(command).await.is_err() {
                return Ok(());
            }
        }

        if status.has_changed().unwrap_or(false) {
            let text = status.borrow_and_update().clone();
            if !text.is_empty() {
                tracing::info!("{}", text);
            }
        }

        renderer.render(&texture_creator, &handle.shared)?;
        tokio::time::sleep(Duration::from_millis(16)).await;
    }
}
