//! Asset preloading: warms the media cache ahead of playback need.
//!
//! Assets are warmed in batches of bounded size so network and decoder load
//! stay capped. Each asset passes a readiness gate (metadata, data and
//! can-play, order-independent) before it counts as warmed; failures retry
//! with exponential backoff and jitter, and exhausted retries degrade to
//! on-demand loading instead of failing the warm-up as a whole.

use crate::cache::{MediaCache, WarmedMedia};
use crate::catalog::{Asset, AssetKind};
use crate::media::{DecodeProbe, MediaFetcher, ProbeInfo};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

pub const DEFAULT_CONCURRENCY: usize = 2;

const MAX_ATTEMPTS: u32 = 5;
const BASE_RETRY_MS: u64 = 2_000;
const MAX_RETRY_MS: u64 = 15_000;
const JITTER_MS: u64 = 2_000;

/// One asset to warm.
#[derive(Debug, Clone)]
pub struct PreloadRequest {
    pub asset_id: String,
    pub url: String,
    pub kind: AssetKind,
}

impl From<&Asset> for PreloadRequest {
    fn from(asset: &Asset) -> Self {
        Self {
            asset_id: asset.id.clone(),
            url: asset.url.clone(),
            kind: asset.kind,
        }
    }
}

/// Terminal result of warming one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// Warmed and published for the current house.
    Ready,
    /// Was already warmed when the request arrived.
    AlreadyWarm,
    /// Every attempt failed; the asset loads on demand when played.
    Unavailable(String),
    /// Finished after its house was switched away; result discarded.
    Stale,
}

/// Per-asset readiness state, driven by load events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Idle,
    Loading,
    Stalled,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyEvent {
    MetadataLoaded,
    DataLoaded,
    CanPlay,
    Progress,
    Stalled,
    Error,
}

/// Tracks the three readiness signals for one asset. The asset is ready only
/// once metadata, data and can-play have all fired, in any order; a single
/// signal is not sufficient.
#[derive(Debug, Clone)]
pub struct Readiness {
    state: ReadyState,
    metadata: bool,
    data: bool,
    can_play: bool,
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            state: ReadyState::Idle,
            metadata: false,
            data: false,
            can_play: false,
        }
    }

    pub fn apply(&mut self, event: ReadyEvent) {
        if self.state == ReadyState::Failed {
            return;
        }
        match event {
            ReadyEvent::MetadataLoaded => self.metadata = true,
            ReadyEvent::DataLoaded => self.data = true,
            ReadyEvent::CanPlay => self.can_play = true,
            ReadyEvent::Progress => {
                if self.state == ReadyState::Stalled {
                    self.state = ReadyState::Loading;
                }
                return;
            }
            ReadyEvent::Stalled => {
                if self.state != ReadyState::Ready {
                    self.state = ReadyState::Stalled;
                }
                return;
            }
            ReadyEvent::Error => {
                self.state = ReadyState::Failed;
                return;
            }
        }
        if self.metadata && self.data && self.can_play {
            self.state = ReadyState::Ready;
        } else if self.state == ReadyState::Idle {
            self.state = ReadyState::Loading;
        }
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReadyState::Ready
    }
}

/// Timer budgets for one preload attempt.
#[derive(Debug, Clone)]
pub struct PreloadTiming {
    /// Silence on the byte stream before the asset counts as stalled.
    pub stall_detect: Duration,
    /// How long a stall may last before the attempt fails.
    pub stall_give_up: Duration,
    /// How long without forward progress before a stalled attempt fails.
    pub no_progress_give_up: Duration,
    /// Budget for the whole download.
    pub load_timeout: Duration,
    /// Budget for download plus decoder preroll.
    pub ready_timeout: Duration,
}

impl Default for PreloadTiming {
    fn default() -> Self {
        Self {
            stall_detect: Duration::from_secs(3),
            stall_give_up: Duration::from_secs(15),
            no_progress_give_up: Duration::from_secs(10),
            load_timeout: Duration::from_secs(90),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

/// Backoff before retry `attempt` (1-indexed): exponential, capped, plus
/// random jitter so a fleet of viewers does not hammer the backend in step.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = BASE_RETRY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(MAX_RETRY_MS);
    let jitter = rand::thread_rng().gen_range(0..=JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Warms assets into the shared media cache.
pub struct Preloader {
    fetcher: Arc<dyn MediaFetcher>,
    prober: Arc<dyn DecodeProbe>,
    cache: Arc<MediaCache>,
    timing: PreloadTiming,
    in_flight: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

impl Preloader {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        prober: Arc<dyn DecodeProbe>,
        cache: Arc<MediaCache>,
        timing: PreloadTiming,
    ) -> Self {
        Self {
            fetcher,
            prober,
            cache,
            timing,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Warm every requested asset. Resolves once every id has been attempted;
    /// never fails. `on_progress` receives the attempted percentage after
    /// each terminal outcome and reaches 100 exactly when the last asset
    /// settles.
    pub async fn warm<F>(
        &self,
        requests: Vec<PreloadRequest>,
        concurrency: usize,
        epoch: u64,
        on_progress: F,
    ) -> Vec<(String, PreloadOutcome)>
    where
        F: Fn(f32) + Send + Sync,
    {
        let mut seen = HashSet::new();
        let mut queue: Vec<PreloadRequest> = requests
            .into_iter()
            .filter(|req| seen.insert(req.asset_id.clone()))
            .collect();
        // Aerial videos are visible first, so they warm first.
        queue.sort_by_key(|req| if req.kind == AssetKind::Aerial { 0 } else { 1 });

        let total = queue.len();
        if total == 0 {
            on_progress(100.0);
            return Vec::new();
        }

        tracing::info!("Preloading {} assets (concurrency {})", total, concurrency);
        let completed = AtomicUsize::new(0);
        let mut results = Vec::with_capacity(total);
        for batch in queue.chunks(concurrency.max(1)) {
            let outcomes = futures_util::future::join_all(batch.iter().map(|req| {
                let completed = &completed;
                let on_progress = &on_progress;
                async move {
                    let outcome = self.warm_one(req, epoch).await;
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    on_progress(done as f32 / total as f32 * 100.0);
                    (req.asset_id.clone(), outcome)
                }
            }))
            .await;
            results.extend(outcomes);
        }
        tracing::info!(
            "Preloading complete: {}/{} warmed",
            self.cache.warmed_count().await,
            total
        );
        results
    }

    async fn warm_one(&self, req: &PreloadRequest, epoch: u64) -> PreloadOutcome {
        if epoch != self.cache.current_epoch() {
            return PreloadOutcome::Stale;
        }
        if self.cache.warmed(&req.asset_id).await.is_some() {
            return PreloadOutcome::AlreadyWarm;
        }

        // One in-flight attempt per asset id: a concurrent request for the
        // same id waits on the winner instead of duplicating work.
        let owner = {
            let mut map = self.in_flight.lock().expect("in-flight lock");
            match map.get(&req.asset_id) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    map.insert(req.asset_id.clone(), rx);
                    Ok(tx)
                }
            }
        };

        match owner {
            Err(mut rx) => {
                let _ = rx.wait_for(|done| *done).await;
                if self.cache.warmed(&req.asset_id).await.is_some() {
                    PreloadOutcome::Ready
                } else {
                    PreloadOutcome::Unavailable("observed attempt failed".into())
                }
            }
            Ok(tx) => {
                let outcome = self.attempt_with_retries(req, epoch).await;
                self.in_flight
                    .lock()
                    .expect("in-flight lock")
                    .remove(&req.asset_id);
                let _ = tx.send(true);
                outcome
            }
        }
    }

    async fn attempt_with_retries(&self, req: &PreloadRequest, epoch: u64) -> PreloadOutcome {
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(req).await {
                Ok((path, bytes, probe)) => {
                    let media = WarmedMedia::new(req.asset_id.clone(), path, bytes, &probe);
                    return if self.cache.insert_warmed(media, epoch).await {
                        PreloadOutcome::Ready
                    } else {
                        PreloadOutcome::Stale
                    };
                }
                Err(err) => {
                    last_error = format!("{:#}", err);
                    tracing::warn!(
                        "Preload attempt {}/{} for {} failed: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        req.asset_id,
                        last_error
                    );
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(retry_delay(attempt)).await;
                    }
                }
            }
        }
        tracing::warn!(
            "Asset {} unavailable for preload, will load on demand: {}",
            req.asset_id,
            last_error
        );
        PreloadOutcome::Unavailable(last_error)
    }

    /// One full warm attempt: bytes on disk, then decoder preroll, guarded
    /// by the load and ready budgets.
    async fn attempt(&self, req: &PreloadRequest) -> Result<(PathBuf, u64, ProbeInfo)> {
        let mut readiness = Readiness::new();
        let result = timeout(self.timing.ready_timeout, async {
            let (path, bytes) = match self.cache.stored(&req.asset_id).await {
                Some((path, bytes)) => {
                    readiness.apply(ReadyEvent::MetadataLoaded);
                    readiness.apply(ReadyEvent::DataLoaded);
                    (path, bytes)
                }
                None => timeout(
                    self.timing.load_timeout,
                    self.download(req, &mut readiness),
                )
                .await
                .map_err(|_| anyhow!("download timed out"))??,
            };
            let probe = self
                .prober
                .probe(&path)
                .await
                .context("decoder preroll failed")?;
            readiness.apply(ReadyEvent::CanPlay);
            Ok::<_, anyhow::Error>((path, bytes, probe))
        })
        .await
        .map_err(|_| anyhow!("asset did not become playable in time"))??;

        if !readiness.is_ready() {
            bail!("readiness gate incomplete ({:?})", readiness.state());
        }
        Ok(result)
    }

    async fn download(
        &self,
        req: &PreloadRequest,
        readiness: &mut Readiness,
    ) -> Result<(PathBuf, u64)> {
        let handle = self
            .fetcher
            .fetch(&req.url)
            .await
            .context("request failed")?;
        readiness.apply(ReadyEvent::MetadataLoaded);

        let content_length = handle.content_length;
        let mut stream = handle.stream;

        let path = self.cache.local_path(&req.asset_id, &req.url);
        let part = path.with_extension("part");
        let mut file = tokio::fs::File::create(&part)
            .await
            .context("Failed to create cache file")?;

        let mut written = 0u64;
        let mut last_progress = Instant::now();
        let mut stalled_at: Option<Instant> = None;
        loop {
            let wait = match stalled_at {
                None => self.timing.stall_detect,
                Some(at) => {
                    let give_up = (at + self.timing.stall_give_up)
                        .min(last_progress + self.timing.no_progress_give_up);
                    give_up.saturating_duration_since(Instant::now())
                }
            };
            match timeout(wait, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    file.write_all(&chunk)
                        .await
                        .context("Failed to write cache file")?;
                    written += chunk.len() as u64;
                    last_progress = Instant::now();
                    if stalled_at.take().is_some() {
                        tracing::debug!("Download of {} resumed after stall", req.asset_id);
                    }
                    readiness.apply(ReadyEvent::Progress);
                }
                Ok(Some(Err(err))) => {
                    readiness.apply(ReadyEvent::Error);
                    return Err(err).context("stream failed");
                }
                Ok(None) => break,
                Err(_) => match stalled_at {
                    None => {
                        stalled_at = Some(Instant::now());
                        readiness.apply(ReadyEvent::Stalled);
                        tracing::warn!("Download of {} stalled", req.asset_id);
                    }
                    Some(_) => {
                        readiness.apply(ReadyEvent::Error);
                        bail!("no forward progress during stall");
                    }
                },
            }
        }

        if let Some(expected) = content_length {
            if written < expected {
                bail!("truncated download: {} of {} bytes", written, expected);
            }
        }

        file.flush().await.context("Failed to flush cache file")?;
        drop(file);
        tokio::fs::rename(&part, &path)
            .await
            .context("Failed to finalize cache file")?;
        self.cache.commit_stored(&req.asset_id, &path, written).await;
        readiness.apply(ReadyEvent::DataLoaded);
        Ok((path, written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FetchHandle;
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use futures_util::stream;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum FetchBehavior {
        Succeed,
        FailRequest,
        StallForever,
    }

    struct ScriptedFetcher {
        behavior: HashMap<String, FetchBehavior>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(behavior: &[(&str, FetchBehavior)]) -> Self {
            Self {
                behavior: behavior
                    .iter()
                    .map(|(url, b)| (url.to_string(), *b))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MediaFetcher for ScriptedFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchHandle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .behavior
                .get(url)
                .copied()
                .unwrap_or(FetchBehavior::Succeed);
            Box::pin(async move {
                match behavior {
                    FetchBehavior::FailRequest => bail!("connection refused"),
                    FetchBehavior::Succeed => Ok(FetchHandle {
                        content_length: Some(4),
                        stream: stream::iter(vec![Ok(Bytes::from_static(b"data"))]).boxed(),
                    }),
                    FetchBehavior::StallForever => Ok(FetchHandle {
                        content_length: Some(1024),
                        stream: stream::iter(vec![Ok(Bytes::from_static(b"data"))])
                            .chain(stream::pending())
                            .boxed(),
                    }),
                }
            })
        }
    }

    struct OkProbe;

    impl DecodeProbe for OkProbe {
        fn probe<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, Result<ProbeInfo>> {
            Box::pin(async {
                Ok(ProbeInfo {
                    duration: Some(Duration::from_secs(1)),
                })
            })
        }
    }

    fn request(id: &str, kind: AssetKind) -> PreloadRequest {
        PreloadRequest {
            asset_id: id.into(),
            url: format!("http://media/{}.mp4", id),
            kind,
        }
    }

    fn preloader(fetcher: Arc<dyn MediaFetcher>, cache: Arc<MediaCache>) -> Preloader {
        Preloader::new(fetcher, Arc::new(OkProbe), cache, PreloadTiming::default())
    }

    #[test]
    fn readiness_gate_is_order_independent() {
        let orders = [
            [ReadyEvent::MetadataLoaded, ReadyEvent::DataLoaded, ReadyEvent::CanPlay],
            [ReadyEvent::CanPlay, ReadyEvent::MetadataLoaded, ReadyEvent::DataLoaded],
            [ReadyEvent::DataLoaded, ReadyEvent::CanPlay, ReadyEvent::MetadataLoaded],
        ];
        for order in orders {
            let mut readiness = Readiness::new();
            assert!(!readiness.is_ready());
            for event in order {
                assert!(!readiness.is_ready());
                readiness.apply(event);
            }
            assert!(readiness.is_ready());
        }
    }

    #[test]
    fn readiness_recovers_from_stall_but_not_error() {
        let mut readiness = Readiness::new();
        readiness.apply(ReadyEvent::MetadataLoaded);
        readiness.apply(ReadyEvent::Stalled);
        assert_eq!(readiness.state(), ReadyState::Stalled);
        readiness.apply(ReadyEvent::Progress);
        assert_eq!(readiness.state(), ReadyState::Loading);
        readiness.apply(ReadyEvent::Error);
        assert_eq!(readiness.state(), ReadyState::Failed);
        readiness.apply(ReadyEvent::DataLoaded);
        readiness.apply(ReadyEvent::CanPlay);
        assert!(!readiness.is_ready());
    }

    #[test]
    fn retry_delay_is_exponential_capped_with_bounded_jitter() {
        for attempt in 1..=MAX_ATTEMPTS {
            let base = (BASE_RETRY_MS * (1 << attempt)).min(MAX_RETRY_MS);
            for _ in 0..20 {
                let delay = retry_delay(attempt).as_millis() as u64;
                assert!(delay >= base, "attempt {}: {} < {}", attempt, delay, base);
                assert!(
                    delay <= base + JITTER_MS,
                    "attempt {}: {} > {}",
                    attempt,
                    delay,
                    base + JITTER_MS
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reaches_100_despite_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 1).unwrap());
        let fetcher = Arc::new(ScriptedFetcher::new(&[(
            "http://media/bad.mp4",
            FetchBehavior::FailRequest,
        )]));
        let preloader = preloader(fetcher.clone(), cache.clone());
        let epoch = cache.advance_epoch().await;

        let seen = Mutex::new(Vec::new());
        let outcomes = preloader
            .warm(
                vec![
                    request("good-1", AssetKind::DiveIn),
                    request("bad", AssetKind::FloorLevel),
                    request("good-2", AssetKind::Aerial),
                ],
                2,
                epoch,
                |pct| seen.lock().unwrap().push(pct),
            )
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(*seen.last().unwrap(), 100.0);
        assert_eq!(seen.iter().filter(|&&p| p == 100.0).count(), 1);

        // Aerial jumped the queue despite being submitted last.
        assert_eq!(outcomes[0].0, "good-2");
        assert!(outcomes
            .iter()
            .any(|(id, o)| id == "bad" && matches!(o, PreloadOutcome::Unavailable(_))));
        assert!(cache.warmed("good-1").await.is_some());
        assert!(cache.warmed("good-2").await.is_some());
        assert!(cache.warmed("bad").await.is_none());
        // The failing asset burned every attempt.
        assert_eq!(fetcher.calls(), 2 + MAX_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_download_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 1).unwrap());
        let fetcher = Arc::new(ScriptedFetcher::new(&[(
            "http://media/slow.mp4",
            FetchBehavior::StallForever,
        )]));
        let preloader = preloader(fetcher.clone(), cache.clone());
        let epoch = cache.advance_epoch().await;

        let outcomes = preloader
            .warm(
                vec![request("slow", AssetKind::DiveIn)],
                1,
                epoch,
                |_| {},
            )
            .await;

        assert!(matches!(outcomes[0].1, PreloadOutcome::Unavailable(_)));
        assert_eq!(fetcher.calls(), MAX_ATTEMPTS as usize);
        assert!(cache.warmed("slow").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_warms_share_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 1).unwrap());
        let fetcher = Arc::new(ScriptedFetcher::new(&[]));
        let preloader = preloader(fetcher.clone(), cache.clone());
        let epoch = cache.advance_epoch().await;

        let requests = vec![request("shared", AssetKind::DiveIn)];
        let (first, second) = tokio::join!(
            preloader.warm(requests.clone(), 1, epoch, |_| {}),
            preloader.warm(requests.clone(), 1, epoch, |_| {}),
        );

        assert_eq!(fetcher.calls(), 1);
        let outcomes = [first[0].1.clone(), second[0].1.clone()];
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, PreloadOutcome::Ready | PreloadOutcome::AlreadyWarm)));
        assert!(cache.warmed("shared").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_epoch_results_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 1).unwrap());
        let fetcher = Arc::new(ScriptedFetcher::new(&[]));
        let preloader = preloader(fetcher.clone(), cache.clone());
        let epoch = cache.advance_epoch().await;

        // The house is switched away before the warm starts committing.
        cache.advance_epoch().await;
        let outcomes = preloader
            .warm(vec![request("v1", AssetKind::DiveIn)], 1, epoch, |_| {})
            .await;

        assert_eq!(outcomes[0].1, PreloadOutcome::Stale);
        assert!(cache.warmed("v1").await.is_none());
    }
}
