//! Tour playback orchestration.
//!
//! The engine owns the current house, the view state and the active media
//! sink. It reacts to pointer input and sink events, driving the
//! aerial -> dive-in -> floor-level -> zoom-out -> aerial sequence one
//! transition at a time. Clicks that arrive while a transition is in flight
//! are dropped, and every view change fully tears the previous sink down
//! before constructing the next one.

use crate::api::TourDataSource;
use crate::assets::{PreloadRequest, Preloader};
use crate::cache::MediaCache;
use crate::catalog::{Asset, AssetCatalog, Leg};
use crate::config::Settings;
use crate::hotspots::{Hotspot, HotspotKind, HotspotRegistry, PixelPolygon};
use crate::media::{MediaSink, MediaSource, SinkEvent, SinkFactory, VideoFrame};
use crate::playback::PlaybackController;
use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Input and control events the engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    PointerMove { x: f32, y: f32 },
    PointerClick { x: f32, y: f32 },
    Back,
    SwitchHouse(u32),
    Reload,
    ViewportResized { width: u32, height: u32 },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    DiveIn,
    ZoomOut,
}

/// Which view is visible. Exactly one at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Aerial,
    Transitioning(TransitionKind),
    FloorLevel,
}

/// Info shown for a secondary hotspot. Non-blocking: the aerial view keeps
/// playing underneath.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoOverlay {
    pub title: String,
    pub description: String,
}

/// State the render surface reads each frame.
pub struct SharedView {
    pub state: RwLock<ViewState>,
    pub frame: RwLock<Option<Arc<Mutex<Option<VideoFrame>>>>>,
    pub polygons: RwLock<Vec<PixelPolygon>>,
    pub hovered: RwLock<Option<String>>,
    pub overlay: RwLock<Option<InfoOverlay>>,
}

impl SharedView {
    fn new() -> Self {
        Self {
            state: RwLock::new(ViewState::Aerial),
            frame: RwLock::new(None),
            polygons: RwLock::new(Vec::new()),
            hovered: RwLock::new(None),
            overlay: RwLock::new(None),
        }
    }
}

/// Channels the rest of the application uses to talk to a running engine.
pub struct EngineHandle {
    pub commands: mpsc::Sender<EngineCommand>,
    pub status: watch::Receiver<String>,
    pub shared: Arc<SharedView>,
}

struct HouseContext {
    id: u32,
    catalog: AssetCatalog,
    registry: HotspotRegistry,
}

struct ActiveLeg {
    sink: Box<dyn MediaSink>,
    events: broadcast::Receiver<SinkEvent>,
}

enum Wake {
    Command(Option<EngineCommand>),
    Sink(SinkEvent),
}

/// The playback orchestration engine.
pub struct TourEngine {
    data: Arc<dyn TourDataSource>,
    sinks: Arc<dyn SinkFactory>,
    preloader: Arc<Preloader>,
    cache: Arc<MediaCache>,
    controller: PlaybackController,
    shared: Arc<SharedView>,
    status: watch::Sender<String>,
    commands: mpsc::Receiver<EngineCommand>,
    preload_concurrency: usize,
    play_retry_delay: Duration,
    viewport: (u32, u32),
    state: ViewState,
    house: Option<HouseContext>,
    active: Option<ActiveLeg>,
    aerial_resume: Option<Duration>,
    current_hotspot: Option<String>,
    pending_house: Option<u32>,
}

impl TourEngine {
    /// Construct the engine. Fails hard when the media backend cannot
    /// produce a sink, since no view could ever be established.
    pub fn new(
        data: Arc<dyn TourDataSource>,
        sinks: Arc<dyn SinkFactory>,
        preloader: Arc<Preloader>,
        cache: Arc<MediaCache>,
        settings: &Settings,
    ) -> Result<(Self, EngineHandle)> {
        sinks
            .create()
            .context("Media backend cannot create a playback sink")?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(String::new());
        let shared = Arc::new(SharedView::new());

        let engine = Self {
            data,
            sinks,
            preloader,
            cache,
            controller: PlaybackController::new(),
            shared: shared.clone(),
            status: status_tx,
            commands: command_rx,
            preload_concurrency: settings.preload_concurrency,
            play_retry_delay: Duration::from_millis(settings.play_retry_delay_ms),
            viewport: (1920, 1080),
            state: ViewState::Aerial,
            house: None,
            active: None,
            aerial_resume: None,
            current_hotspot: None,
            pending_house: None,
        };
        let handle = EngineHandle {
            commands: command_tx,
            status: status_rx,
            shared,
        };
        Ok((engine, handle))
    }

    /// Drive the engine until shutdown.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let wake = {
                let commands = &mut self.commands;
                let active = &mut self.active;
                tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    event = next_event(active) => Wake::Sink(event),
                }
            };
            match wake {
                Wake::Command(None) | Wake::Command(Some(EngineCommand::Shutdown)) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Sink(event) => self.handle_sink_event(event).await,
            }
        }
        self.teardown_active();
        tracing::info!("Engine stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::PointerMove { x, y } => self.update_hover(x, y),
            EngineCommand::PointerClick { x, y } => self.handle_click(x, y).await,
            EngineCommand::Back => self.handle_back().await,
            EngineCommand::SwitchHouse(house_id) => self.switch_house(house_id).await,
            EngineCommand::Reload => {
                if let Some(house_id) = self.house.as_ref().map(|h| h.id) {
                    tracing::info!("Content changed, reloading house {}", house_id);
                    self.load_house(house_id).await;
                }
            }
            EngineCommand::ViewportResized { width, height } => {
                self.viewport = (width, height);
                self.publish_polygons();
            }
            EngineCommand::Shutdown => {}
        }
    }

    async fn handle_sink_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::Ended => self.advance_sequence().await,
            SinkEvent::Error(message) => {
                tracing::error!("Unrecoverable playback error: {}", message);
                self.set_status("Video error, returning to aerial view");
                self.return_to_aerial().await;
            }
            SinkEvent::Stalled => self.set_status("Buffering"),
            SinkEvent::Prerolled | SinkEvent::Playing | SinkEvent::Paused => {}
        }
    }

    fn update_hover(&mut self, x: f32, y: f32) {
        if self.state != ViewState::Aerial {
            return;
        }
        let hovered = self
            .house
            .as_ref()
            .and_then(|h| h.registry.hit_test(self.viewport.0, self.viewport.1, x, y))
            .map(|hotspot| hotspot.id.clone());
        *self.shared.hovered.write().unwrap() = hovered;
    }

    async fn handle_click(&mut self, x: f32, y: f32) {
        if self.state != ViewState::Aerial {
            tracing::debug!("Click ignored while a transition is in flight");
            return;
        }
        if self.shared.overlay.read().unwrap().is_some() {
            // A click with the overlay open just dismisses it.
            *self.shared.overlay.write().unwrap() = None;
            return;
        }
        let hit: Option<Hotspot> = self.house.as_ref().and_then(|house| {
            house
                .registry
                .hit_test(self.viewport.0, self.viewport.1, x, y)
                .cloned()
        });
        let Some(hotspot) = hit else {
            if self.active.is_none() && self.house.is_some() {
                // Aerial playback previously failed; any click retries it.
                let resume = self.aerial_resume.take();
                self.enter_aerial(resume).await;
            }
            return;
        };
        match hotspot.kind {
            HotspotKind::Secondary => {
                tracing::info!("Showing info overlay for hotspot {}", hotspot.id);
                *self.shared.overlay.write().unwrap() = Some(InfoOverlay {
                    title: hotspot.title,
                    description: hotspot.description,
                });
            }
            HotspotKind::Primary => self.begin_dive_in(hotspot).await,
        }
    }

    async fn begin_dive_in(&mut self, hotspot: Hotspot) {
        let Some(asset) = self
            .house
            .as_ref()
            .and_then(|h| h.catalog.leg_asset(&hotspot.id, Leg::DiveIn))
            .cloned()
        else {
            tracing::info!("Hotspot {} has no dive-in video", hotspot.id);
            self.set_status(&format!("No tour available for {}", hotspot.title));
            return;
        };
        self.aerial_resume = self.active.as_ref().and_then(|leg| leg.sink.position());
        self.current_hotspot = Some(hotspot.id.clone());
        self.set_status(&format!("Entering {}", hotspot.title));
        self.play_leg(&asset, ViewState::Transitioning(TransitionKind::DiveIn))
            .await;
    }

    async fn handle_back(&mut self) {
        match self.state {
            ViewState::FloorLevel | ViewState::Transitioning(TransitionKind::DiveIn) => {
                tracing::info!("Back requested, synthesizing zoom-out");
                self.begin_zoom_out().await;
            }
            ViewState::Aerial => {
                *self.shared.overlay.write().unwrap() = None;
            }
            ViewState::Transitioning(TransitionKind::ZoomOut) => {}
        }
    }

    async fn advance_sequence(&mut self) {
        match self.state {
            ViewState::Transitioning(TransitionKind::DiveIn) => {
                if let Some(house_id) = self.pending_house.take() {
                    // The ended clip was a house-to-house transition.
                    self.load_house(house_id).await;
                    return;
                }
                match self.current_leg_asset(Leg::FloorLevel) {
                    Some(asset) => self.play_leg(&asset, ViewState::FloorLevel).await,
                    None => {
                        tracing::info!("No floor-level video, returning to aerial");
                        self.return_to_aerial().await;
                    }
                }
            }
            ViewState::FloorLevel => self.begin_zoom_out().await,
            ViewState::Transitioning(TransitionKind::ZoomOut) => self.return_to_aerial().await,
            ViewState::Aerial => {
                // The aerial sink loops internally; an Ended here means the
                // source was not loopable, so rebuild it.
                self.return_to_aerial().await;
            }
        }
    }

    async fn begin_zoom_out(&mut self) {
        match self.current_leg_asset(Leg::ZoomOut) {
            Some(asset) => {
                self.play_leg(&asset, ViewState::Transitioning(TransitionKind::ZoomOut))
                    .await
            }
            None => {
                tracing::info!("No zoom-out video, returning to aerial");
                self.return_to_aerial().await;
            }
        }
    }

    fn current_leg_asset(&self, leg: Leg) -> Option<Asset> {
        let house = self.house.as_ref()?;
        let hotspot_id = self.current_hotspot.as_deref()?;
        house.catalog.leg_asset(hotspot_id, leg).cloned()
    }

    /// Tear the current view down and play `asset` as the next one.
    async fn play_leg(&mut self, asset: &Asset, target: ViewState) {
        self.detach_input();
        self.teardown_active();
        match self.start_sink(asset, false, None).await {
            Ok(leg) => {
                self.active = Some(leg);
                self.set_state(target);
            }
            Err(err) => {
                tracing::error!("Failed to play {}: {:#}", asset.id, err);
                self.set_status("Playback failed, returning to aerial view");
                if let Some(house_id) = self.pending_house.take() {
                    // Skip the broken transition clip, finish the switch.
                    self.load_house(house_id).await;
                } else {
                    self.return_to_aerial().await;
                }
            }
        }
    }

    /// Build a sink for the asset, preferring the warmed cache entry and
    /// falling back to an inline remote load. Plays with one retry for
    /// policy-style rejections.
    async fn start_sink(
        &mut self,
        asset: &Asset,
        looping: bool,
        resume: Option<Duration>,
    ) -> Result<ActiveLeg> {
        let mut sink = self.sinks.create()?;
        let source = match self.cache.warmed(&asset.id).await {
            Some(warmed) => MediaSource::Local(warmed.path),
            None => {
                tracing::debug!("Asset {} not warmed, loading inline", asset.id);
                MediaSource::Remote(asset.url.clone())
            }
        };
        sink.set_looping(looping);
        sink.load(&source)?;
        let events = sink.subscribe();
        *self.shared.frame.write().unwrap() = Some(sink.frame_handle());
        if let Some(position) = resume {
            if let Err(err) = sink.seek(position) {
                tracing::warn!("Failed to restore playback position: {:#}", err);
            }
        }
        if let Err(first) = self.controller.safe_play(sink.as_mut()).await {
            tracing::warn!("Play rejected ({}), retrying once", first);
            self.set_status("Playback blocked, retrying");
            tokio::time::sleep(self.play_retry_delay).await;
            self.controller
                .safe_play(sink.as_mut())
                .await
                .map_err(|second| anyhow!("play failed after retry: {}", second))?;
        }
        Ok(ActiveLeg { events, sink })
    }

    async fn return_to_aerial(&mut self) {
        self.pending_house = None;
        self.current_hotspot = None;
        let resume = self.aerial_resume.take();
        self.enter_aerial(resume).await;
    }

    async fn enter_aerial(&mut self, resume: Option<Duration>) {
        self.teardown_active();
        self.set_state(ViewState::Aerial);
        let aerial = self
            .house
            .as_ref()
            .and_then(|h| h.catalog.aerial_asset())
            .cloned();
        match aerial {
            None => {
                tracing::warn!("House has no aerial video configured");
                self.set_status("No aerial video configured");
            }
            Some(asset) => match self.start_sink(&asset, true, resume).await {
                Ok(leg) => {
                    self.active = Some(leg);
                    self.set_status("");
                }
                Err(err) => {
                    tracing::error!("Failed to start aerial video: {:#}", err);
                    self.set_status("Aerial video failed, click to retry");
                }
            },
        }
        self.publish_polygons();
    }

    async fn switch_house(&mut self, house_id: u32) {
        if self.house.as_ref().is_some_and(|h| h.id == house_id) {
            return;
        }
        let clip = self
            .house
            .as_ref()
            .and_then(|h| h.catalog.transition_asset(h.id, house_id))
            .cloned();
        match clip {
            Some(asset) => {
                tracing::info!("Playing house transition clip {}", asset.id);
                self.aerial_resume = None;
                self.current_hotspot = None;
                self.pending_house = Some(house_id);
                self.play_leg(&asset, ViewState::Transitioning(TransitionKind::DiveIn))
                    .await;
            }
            None => self.load_house(house_id).await,
        }
    }

    /// Fetch everything for a house, rebuild registry and catalog, warm the
    /// cache in the background, then show the aerial view.
    async fn load_house(&mut self, house_id: u32) {
        tracing::info!("Loading house {}", house_id);
        self.set_status(&format!("Loading house {}", house_id));
        self.detach_input();
        self.teardown_active();
        self.current_hotspot = None;
        self.aerial_resume = None;
        self.pending_house = None;

        // New epoch: warmed entries of the previous house are gone, and any
        // of its preloads still in flight will be discarded on commit.
        let epoch = self.cache.advance_epoch().await;

        let (hotspots, assets, house_videos, hotspot_videos, playlists, global_videos) = tokio::join!(
            self.data.hotspots(house_id),
            self.data.assets(house_id),
            self.data.house_videos(house_id),
            self.data.hotspot_videos(house_id),
            self.data.playlists(house_id),
            self.data.global_videos(),
        );
        let catalog = AssetCatalog::build(
            unwrap_or_logged(assets, "assets"),
            unwrap_or_logged(house_videos, "house videos"),
            unwrap_or_logged(hotspot_videos, "hotspot videos"),
            unwrap_or_logged(playlists, "playlists"),
            unwrap_or_logged(global_videos, "global videos"),
        );
        let registry =
            HotspotRegistry::from_records(unwrap_or_logged(hotspots, "hotspots").hotspots);
        if registry.is_empty() {
            tracing::warn!("House {} has no renderable hotspots", house_id);
        }

        let warm_list: Vec<PreloadRequest> = catalog
            .preload_assets()
            .iter()
            .map(PreloadRequest::from)
            .collect();
        tracing::info!(
            "House {}: {} hotspots, {} assets to warm",
            house_id,
            registry.len(),
            warm_list.len()
        );

        self.house = Some(HouseContext {
            id: house_id,
            catalog,
            registry,
        });

        let preloader = self.preloader.clone();
        let status = self.status.clone();
        let concurrency = self.preload_concurrency;
        tokio::spawn(async move {
            preloader
                .warm(warm_list, concurrency, epoch, move |pct| {
                    let _ = status.send(format!("Preloading {:.0}%", pct));
                })
                .await;
        });

        self.enter_aerial(None).await;
    }

    fn set_state(&mut self, state: ViewState) {
        if self.state != state {
            tracing::info!("View state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        *self.shared.state.write().unwrap() = state;
        self.publish_polygons();
    }

    /// Hotspot polygons are only live in the aerial view; during transitions
    /// the hit-test layer is empty so clicks cannot land.
    fn publish_polygons(&self) {
        let polygons = match (&self.house, self.state) {
            (Some(house), ViewState::Aerial) => {
                house.registry.project(self.viewport.0, self.viewport.1)
            }
            _ => Vec::new(),
        };
        *self.shared.polygons.write().unwrap() = polygons;
    }

    fn detach_input(&mut self) {
        *self.shared.polygons.write().unwrap() = Vec::new();
        *self.shared.hovered.write().unwrap() = None;
        *self.shared.overlay.write().unwrap() = None;
    }

    fn teardown_active(&mut self) {
        if let Some(mut leg) = self.active.take() {
            leg.sink.detach();
        }
        *self.shared.frame.write().unwrap() = None;
    }

    fn set_status(&self, text: &str) {
        if !text.is_empty() {
            tracing::debug!("Status: {}", text);
        }
        let _ = self.status.send(text.to_string());
    }
}

async fn next_event(active: &mut Option<ActiveLeg>) -> SinkEvent {
    let Some(leg) = active else {
        return std::future::pending().await;
    };
    loop {
        match leg.events.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Dropped {} sink events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return std::future::pending().await;
            }
        }
    }
}

fn unwrap_or_logged<T: Default>(result: Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("Failed to fetch {}: {:#}", what, err);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        AssetRecord, AssetsResponse, GlobalVideosResponse, HotspotRecord, HotspotVideosResponse,
        HotspotsResponse, HouseVideosResponse, PlaylistLegs, PlaylistsResponse, PointDto, VideoRef,
    };
    use crate::assets::PreloadTiming;
    use crate::media::{DecodeProbe, FetchHandle, MediaFetcher, ProbeInfo};
    use anyhow::bail;
    use futures_util::future::BoxFuture;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    // ---- data source double -------------------------------------------------

    #[derive(Default, Clone)]
    struct HouseFixture {
        hotspots: Vec<HotspotRecord>,
        assets: Vec<AssetRecord>,
        aerial: Option<String>,
        playlists: HashMap<String, PlaylistLegs>,
    }

    #[derive(Default)]
    struct StaticData {
        houses: HashMap<u32, HouseFixture>,
        globals: HashMap<String, String>,
    }

    impl TourDataSource for StaticData {
        fn hotspots(&self, house_id: u32) -> BoxFuture<'_, Result<HotspotsResponse>> {
            let hotspots = self
                .houses
                .get(&house_id)
                .map(|h| h.hotspots.clone())
                .unwrap_or_default();
            Box::pin(async move { Ok(HotspotsResponse { hotspots }) })
        }

        fn assets(&self, house_id: u32) -> BoxFuture<'_, Result<AssetsResponse>> {
            let assets = self
                .houses
                .get(&house_id)
                .map(|h| h.assets.clone())
                .unwrap_or_default();
            Box::pin(async move { Ok(AssetsResponse { assets }) })
        }

        fn house_videos(&self, house_id: u32) -> BoxFuture<'_, Result<HouseVideosResponse>> {
            let aerial = self.houses.get(&house_id).and_then(|h| h.aerial.clone());
            Box::pin(async move {
                let json = match aerial {
                    Some(id) => format!(r#"{{"houseVideo":{{"aerial":{{"videoId":"{}"}}}}}}"#, id),
                    None => "{}".to_string(),
                };
                Ok(serde_json::from_str(&json)?)
            })
        }

        fn hotspot_videos(&self, _house_id: u32) -> BoxFuture<'_, Result<HotspotVideosResponse>> {
            Box::pin(async { Ok(HotspotVideosResponse::default()) })
        }

        fn global_videos(&self) -> BoxFuture<'_, Result<GlobalVideosResponse>> {
            let global_videos = self
                .globals
                .iter()
                .map(|(key, id)| {
                    (
                        key.clone(),
                        VideoRef {
                            video_id: Some(id.clone()),
                        },
                    )
                })
                .collect();
            Box::pin(async move { Ok(GlobalVideosResponse { global_videos }) })
        }

        fn playlists(&self, house_id: u32) -> BoxFuture<'_, Result<PlaylistsResponse>> {
            let playlists = self
                .houses
                .get(&house_id)
                .map(|h| h.playlists.clone())
                .unwrap_or_default();
            Box::pin(async move { Ok(PlaylistsResponse { playlists }) })
        }
    }

    // ---- sink double --------------------------------------------------------

    struct SinkState {
        loaded: StdMutex<Option<MediaSource>>,
        looping: AtomicBool,
        detached: AtomicBool,
        position: StdMutex<Option<Duration>>,
        seeks: StdMutex<Vec<Duration>>,
        events: broadcast::Sender<SinkEvent>,
    }

    impl SinkState {
        fn loaded_url(&self) -> Option<String> {
            match self.loaded.lock().unwrap().clone() {
                Some(MediaSource::Remote(url)) => Some(url),
                Some(MediaSource::Local(path)) => Some(path.display().to_string()),
                None => None,
            }
        }

        fn end(&self) {
            let _ = self.events.send(SinkEvent::Ended);
        }
    }

    struct TestSink {
        state: Arc<SinkState>,
    }

    impl MediaSink for TestSink {
        fn load(&mut self, source: &MediaSource) -> Result<()> {
            *self.state.loaded.lock().unwrap() = Some(source.clone());
            Ok(())
        }

        fn play(&mut self) -> Result<()> {
            let _ = self.state.events.send(SinkEvent::Playing);
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            let _ = self.state.events.send(SinkEvent::Paused);
            Ok(())
        }

        fn seek(&mut self, position: Duration) -> Result<()> {
            self.state.seeks.lock().unwrap().push(position);
            Ok(())
        }

        fn position(&self) -> Option<Duration> {
            *self.state.position.lock().unwrap()
        }

        fn set_looping(&mut self, looping: bool) {
            self.state.looping.store(looping, Ordering::SeqCst);
        }

        fn frame_handle(&self) -> Arc<Mutex<Option<VideoFrame>>> {
            Arc::new(Mutex::new(None))
        }

        fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
            self.state.events.subscribe()
        }

        fn detach(&mut self) {
            self.state.detached.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct TestSinkFactory {
        created: StdMutex<Vec<Arc<SinkState>>>,
    }

    impl TestSinkFactory {
        fn count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn sink(&self, index: usize) -> Arc<SinkState> {
            self.created.lock().unwrap()[index].clone()
        }
    }

    impl SinkFactory for TestSinkFactory {
        fn create(&self) -> Result<Box<dyn MediaSink>> {
            let (events, _) = broadcast::channel(16);
            let state = Arc::new(SinkState {
                loaded: StdMutex::new(None),
                looping: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                position: StdMutex::new(None),
                seeks: StdMutex::new(Vec::new()),
                events,
            });
            self.created.lock().unwrap().push(state.clone());
            Ok(Box::new(TestSink { state }))
        }
    }

    // ---- fetch/probe doubles ------------------------------------------------

    /// Always fails, so every asset is served through the inline remote path
    /// and the loaded URL identifies the asset under test.
    struct OfflineFetcher;

    impl MediaFetcher for OfflineFetcher {
        fn fetch<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<FetchHandle>> {
            Box::pin(async { bail!("offline") })
        }
    }

    struct OkProbe;

    impl DecodeProbe for OkProbe {
        fn probe<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, Result<ProbeInfo>> {
            Box::pin(async { Ok(ProbeInfo::default()) })
        }
    }

    // ---- harness ------------------------------------------------------------

    fn asset(id: &str, kind: &str) -> AssetRecord {
        AssetRecord {
            id: id.into(),
            name: id.into(),
            kind: kind.into(),
            url: Some(format!("http://media/{}.mp4", id)),
            house_id: Some(1),
            hotspot_id: None,
        }
    }

    fn hotspot(id: &str, kind: &str, points: &[(f32, f32)]) -> HotspotRecord {
        HotspotRecord {
            id: id.into(),
            title: format!("Hotspot {}", id),
            kind: kind.into(),
            points: points.iter().map(|&(x, y)| PointDto { x, y }).collect(),
            description: Some("details".into()),
            house_id: Some(1),
        }
    }

    fn legs(dive_in: Option<&str>, floor_level: Option<&str>, zoom_out: Option<&str>) -> PlaylistLegs {
        let wrap = |id: Option<&str>| {
            id.map(|id| VideoRef {
                video_id: Some(id.into()),
            })
        };
        PlaylistLegs {
            dive_in: wrap(dive_in),
            floor_level: wrap(floor_level),
            zoom_out: wrap(zoom_out),
        }
    }

    fn full_house() -> HouseFixture {
        HouseFixture {
            hotspots: vec![
                hotspot("h1", "primary", &[(40.0, 40.0), (60.0, 40.0), (60.0, 60.0), (40.0, 60.0)]),
                hotspot("h2", "secondary", &[(0.0, 0.0), (20.0, 0.0), (20.0, 20.0), (0.0, 20.0)]),
                hotspot("h3", "primary", &[(80.0, 80.0), (95.0, 80.0), (95.0, 95.0), (80.0, 95.0)]),
            ],
            assets: vec![
                asset("a0", "aerial"),
                asset("v1", "diveIn"),
                asset("v2", "floorLevel"),
                asset("v3", "zoomOut"),
            ],
            aerial: Some("a0".into()),
            playlists: [
                ("h1".to_string(), legs(Some("v1"), Some("v2"), Some("v3"))),
                ("h3".to_string(), legs(None, Some("v2"), Some("v3"))),
            ]
            .into_iter()
            .collect(),
        }
    }

    struct Harness {
        commands: mpsc::Sender<EngineCommand>,
        shared: Arc<SharedView>,
        factory: Arc<TestSinkFactory>,
        task: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn state(&self) -> ViewState {
            *self.shared.state.read().unwrap()
        }

        async fn send(&self, command: EngineCommand) {
            self.commands.send(command).await.unwrap();
        }

        async fn wait_until(&self, what: &str, check: impl Fn(&Self) -> bool) {
            for _ in 0..1000 {
                if check(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            panic!("timed out waiting for {}", what);
        }

        async fn shutdown(self) {
            let _ = self.commands.send(EngineCommand::Shutdown).await;
            let _ = self.task.await;
        }
    }

    async fn harness(data: StaticData) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 1).unwrap());
        let preloader = Arc::new(Preloader::new(
            Arc::new(OfflineFetcher),
            Arc::new(OkProbe),
            cache.clone(),
            PreloadTiming::default(),
        ));
        let factory = Arc::new(TestSinkFactory::default());
        let settings = Settings {
            backend_url: "http://backend".into(),
            device_id: None,
            initial_house: 1,
            cache_dir: dir.path().to_path_buf(),
            cache_max_gb: 1,
            preload_concurrency: 2,
            play_retry_delay_ms: 10,
        };
        let (engine, handle) = TourEngine::new(
            Arc::new(data),
            factory.clone(),
            preloader,
            cache,
            &settings,
        )
        .unwrap();
        let task = tokio::spawn(engine.run());
        Harness {
            commands: handle.commands,
            shared: handle.shared,
            factory,
            task,
            _dir: dir,
        }
    }

    fn single_house(fixture: HouseFixture) -> StaticData {
        StaticData {
            houses: [(1, fixture)].into_iter().collect(),
            globals: HashMap::new(),
        }
    }

    // The probe sink created by the constructor check is index 0; sinks the
    // engine actually plays through start at index 1.
    const FIRST_PLAYED_SINK: usize = 1;

    #[tokio::test(start_paused = true)]
    async fn full_sequence_returns_to_aerial_and_resumes_position() {
        let h = harness(single_house(full_house())).await;
        h.send(EngineCommand::SwitchHouse(1)).await;
        h.wait_until("aerial up", |h| {
            h.factory.count() > FIRST_PLAYED_SINK && h.state() == ViewState::Aerial
        })
        .await;

        let aerial = h.factory.sink(FIRST_PLAYED_SINK);
        assert!(aerial.looping.load(Ordering::SeqCst));
        assert!(aerial.loaded_url().unwrap().contains("a0"));
        *aerial.position.lock().unwrap() = Some(Duration::from_secs(42));

        // Click the primary hotspot in the viewport center.
        h.send(EngineCommand::PointerClick { x: 960.0, y: 540.0 }).await;
        h.wait_until("dive-in", |h| {
            h.state() == ViewState::Transitioning(TransitionKind::DiveIn)
        })
        .await;
        assert!(aerial.detached.load(Ordering::SeqCst));
        let dive_in = h.factory.sink(FIRST_PLAYED_SINK + 1);
        assert!(dive_in.loaded_url().unwrap().contains("v1"));
        // Hit-test layer is detached during the transition.
        assert!(h.shared.polygons.read().unwrap().is_empty());

        dive_in.end();
        h.wait_until("floor level", |h| h.state() == ViewState::FloorLevel)
            .await;
        let floor = h.factory.sink(FIRST_PLAYED_SINK + 2);
        assert!(floor.loaded_url().unwrap().contains("v2"));
        assert!(dive_in.detached.load(Ordering::SeqCst));

        floor.end();
        h.wait_until("zoom out", |h| {
            h.state() == ViewState::Transitioning(TransitionKind::ZoomOut)
        })
        .await;
        let zoom = h.factory.sink(FIRST_PLAYED_SINK + 3);
        assert!(zoom.loaded_url().unwrap().contains("v3"));

        zoom.end();
        h.wait_until("back to aerial", |h| {
            h.state() == ViewState::Aerial && h.factory.count() == FIRST_PLAYED_SINK + 5
        })
        .await;
        let resumed = h.factory.sink(FIRST_PLAYED_SINK + 4);
        assert!(resumed.loaded_url().unwrap().contains("a0"));
        assert_eq!(
            resumed.seeks.lock().unwrap().as_slice(),
            &[Duration::from_secs(42)]
        );
        assert!(!h.shared.polygons.read().unwrap().is_empty());

        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn secondary_click_opens_overlay_without_state_change() {
        let h = harness(single_house(full_house())).await;
        h.send(EngineCommand::SwitchHouse(1)).await;
        h.wait_until("aerial up", |h| h.factory.count() > FIRST_PLAYED_SINK)
            .await;
        let sinks_before = h.factory.count();

        // Top-left square is the secondary hotspot.
        h.send(EngineCommand::PointerClick { x: 100.0, y: 100.0 }).await;
        h.wait_until("overlay", |h| h.shared.overlay.read().unwrap().is_some())
            .await;
        assert_eq!(h.state(), ViewState::Aerial);
        assert_eq!(h.factory.count(), sinks_before);
        assert_eq!(
            h.shared.overlay.read().unwrap().as_ref().unwrap().title,
            "Hotspot h2"
        );

        // The next click dismisses the overlay instead of acting.
        h.send(EngineCommand::PointerClick { x: 960.0, y: 540.0 }).await;
        h.wait_until("overlay dismissed", |h| {
            h.shared.overlay.read().unwrap().is_none()
        })
        .await;
        assert_eq!(h.state(), ViewState::Aerial);

        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn primary_without_dive_in_stays_aerial() {
        let h = harness(single_house(full_house())).await;
        h.send(EngineCommand::SwitchHouse(1)).await;
        h.wait_until("aerial up", |h| h.factory.count() > FIRST_PLAYED_SINK)
            .await;
        let sinks_before = h.factory.count();

        // h3 is primary but its playlist has no dive-in leg.
        h.send(EngineCommand::PointerClick {
            x: 1920.0 * 0.87,
            y: 1080.0 * 0.87,
        })
        .await;
        // Give the engine a chance to (wrongly) transition.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.state(), ViewState::Aerial);
        assert_eq!(h.factory.count(), sinks_before);

        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clicks_during_transition_are_ignored() {
        let h = harness(single_house(full_house())).await;
        h.send(EngineCommand::SwitchHouse(1)).await;
        h.wait_until("aerial up", |h| h.factory.count() > FIRST_PLAYED_SINK)
            .await;

        h.send(EngineCommand::PointerClick { x: 960.0, y: 540.0 }).await;
        h.wait_until("dive-in", |h| {
            h.state() == ViewState::Transitioning(TransitionKind::DiveIn)
        })
        .await;
        let sinks_mid = h.factory.count();

        h.send(EngineCommand::PointerClick { x: 960.0, y: 540.0 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.state(),
            ViewState::Transitioning(TransitionKind::DiveIn)
        );
        assert_eq!(h.factory.count(), sinks_mid);

        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn back_from_floor_level_synthesizes_zoom_out() {
        let h = harness(single_house(full_house())).await;
        h.send(EngineCommand::SwitchHouse(1)).await;
        h.wait_until("aerial up", |h| h.factory.count() > FIRST_PLAYED_SINK)
            .await;

        h.send(EngineCommand::PointerClick { x: 960.0, y: 540.0 }).await;
        h.wait_until("dive-in", |h| {
            h.state() == ViewState::Transitioning(TransitionKind::DiveIn)
        })
        .await;
        h.factory.sink(FIRST_PLAYED_SINK + 1).end();
        h.wait_until("floor level", |h| h.state() == ViewState::FloorLevel)
            .await;

        h.send(EngineCommand::Back).await;
        h.wait_until("zoom out", |h| {
            h.state() == ViewState::Transitioning(TransitionKind::ZoomOut)
        })
        .await;
        let zoom = h.factory.sink(FIRST_PLAYED_SINK + 3);
        assert!(zoom.loaded_url().unwrap().contains("v3"));

        zoom.end();
        h.wait_until("aerial", |h| h.state() == ViewState::Aerial).await;

        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn playback_error_resets_to_aerial() {
        let h = harness(single_house(full_house())).await;
        h.send(EngineCommand::SwitchHouse(1)).await;
        h.wait_until("aerial up", |h| h.factory.count() > FIRST_PLAYED_SINK)
            .await;

        h.send(EngineCommand::PointerClick { x: 960.0, y: 540.0 }).await;
        h.wait_until("dive-in", |h| {
            h.state() == ViewState::Transitioning(TransitionKind::DiveIn)
        })
        .await;

        let dive_in = h.factory.sink(FIRST_PLAYED_SINK + 1);
        let _ = dive_in.events.send(SinkEvent::Error("decoder died".into()));
        h.wait_until("aerial again", |h| {
            h.state() == ViewState::Aerial && h.factory.count() == FIRST_PLAYED_SINK + 3
        })
        .await;
        assert!(dive_in.detached.load(Ordering::SeqCst));

        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn house_switch_plays_transition_clip_when_configured() {
        let mut house2 = full_house();
        house2.assets.push(asset("b0", "aerial"));
        house2.aerial = Some("b0".into());
        let mut house1 = full_house();
        house1.assets.push(asset("t12", "transition"));
        let data = StaticData {
            houses: [(1, house1), (2, house2)].into_iter().collect(),
            globals: [("1-2".to_string(), "t12".to_string())].into_iter().collect(),
        };

        let h = harness(data).await;
        h.send(EngineCommand::SwitchHouse(1)).await;
        h.wait_until("house 1 aerial", |h| h.factory.count() > FIRST_PLAYED_SINK)
            .await;

        h.send(EngineCommand::SwitchHouse(2)).await;
        h.wait_until("transition clip", |h| {
            h.state() == ViewState::Transitioning(TransitionKind::DiveIn)
        })
        .await;
        let clip = h.factory.sink(FIRST_PLAYED_SINK + 1);
        assert!(clip.loaded_url().unwrap().contains("t12"));

        clip.end();
        h.wait_until("house 2 aerial", |h| {
            h.state() == ViewState::Aerial && h.factory.count() == FIRST_PLAYED_SINK + 3
        })
        .await;
        let aerial2 = h.factory.sink(FIRST_PLAYED_SINK + 2);
        assert!(aerial2.loaded_url().unwrap().contains("b0"));

        h.shutdown().await;
    }
}
