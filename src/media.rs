//! Media abstractions: the sink a video plays through, the fetcher that
//! streams asset bytes, and the probe that primes a decoder.
//!
//! The orchestration engine only ever talks to these traits, so it can run
//! against synthetic implementations that fire events without a real media
//! runtime attached.

use anyhow::Result;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// A decoded RGBA frame handed to the render surface.
#[derive(Clone)]
pub struct VideoFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Where a sink should pull its media from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// A fully-downloaded file in the local cache.
    Local(PathBuf),
    /// Remote URL, decoded while streaming. The slower fallback path.
    Remote(String),
}

/// Notifications emitted by a sink while media plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// The decoder prerolled and can produce frames.
    Prerolled,
    /// A play request settled and playback is running.
    Playing,
    /// A pause request settled.
    Paused,
    /// Playback reached the end of the stream.
    Ended,
    /// The decoder is starved of data.
    Stalled,
    /// Unrecoverable decoder or source failure.
    Error(String),
}

/// Playback surface for a single video.
///
/// Commands are synchronous; completion is reported through the event
/// channel. `detach` must fully release decoder resources, it is not a mute.
pub trait MediaSink: Send {
    fn load(&mut self, source: &MediaSource) -> Result<()>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn seek(&mut self, position: Duration) -> Result<()>;
    fn position(&self) -> Option<Duration>;
    fn set_looping(&mut self, looping: bool);
    fn frame_handle(&self) -> Arc<Mutex<Option<VideoFrame>>>;
    fn subscribe(&self) -> broadcast::Receiver<SinkEvent>;
    fn detach(&mut self);
}

/// Creates sinks on demand; one sink per view, torn down between views.
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn MediaSink>>;
}

/// An accepted asset download: length if the server reported one, plus the
/// byte stream.
pub struct FetchHandle {
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// Streams asset bytes for the preloader.
pub trait MediaFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchHandle>>;
}

/// What the decoder learned while prerolling a downloaded asset.
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
    pub duration: Option<Duration>,
}

/// Primes a decoder over a local file to prove the asset is playable.
pub trait DecodeProbe: Send + Sync {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<ProbeInfo>>;
}
