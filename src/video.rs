//! GStreamer-backed media sink and decode probe.
//!
//! One pipeline per view: uridecodebin feeding videoconvert/videoscale into
//! an RGBA appsink. Bus messages are surfaced as `SinkEvent`s; `detach`
//! drops the pipeline to the Null state so decoder resources never outlive
//! their view.

use crate::media::{DecodeProbe, MediaSink, MediaSource, ProbeInfo, SinkEvent, VideoFrame};
use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Initialize the media backend once at startup.
pub fn init_backend() -> Result<()> {
    gst::init().context("Failed to initialize GStreamer")?;
    tracing::info!("GStreamer initialized: {}", gst::version_string());
    Ok(())
}

fn source_uri(source: &MediaSource) -> Result<String> {
    match source {
        MediaSource::Remote(url) => Ok(url.clone()),
        MediaSource::Local(path) => {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                std::fs::canonicalize(path)
                    .with_context(|| format!("Failed to resolve {:?}", path))?
            };
            Ok(format!("file://{}", absolute.display()))
        }
    }
}

/// Video sink driven by a GStreamer pipeline.
pub struct GstSink {
    pipeline: Option<gst::Pipeline>,
    events: broadcast::Sender<SinkEvent>,
    current_frame: Arc<Mutex<Option<VideoFrame>>>,
    looping: Arc<AtomicBool>,
    bus_watch_guard: Option<gst::bus::BusWatchGuard>,
}

impl GstSink {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            pipeline: None,
            events,
            current_frame: Arc::new(Mutex::new(None)),
            looping: Arc::new(AtomicBool::new(false)),
            bus_watch_guard: None,
        }
    }

    fn build_pipeline(&mut self, uri: &str) -> Result<()> {
        let pipeline = gst::Pipeline::new();

        let src = gst::ElementFactory::make("uridecodebin")
            .name("source")
            .property("uri", uri)
            .build()
            .context("Failed to create uridecodebin")?;

        let convert = gst::ElementFactory::make("videoconvert")
            .name("convert")
            .build()
            .context("Failed to create videoconvert")?;

        let scale = gst::ElementFactory::make("videoscale")
            .name("scale")
            .build()
            .context("Failed to create videoscale")?;

        let appsink = gst_app::AppSink::builder()
            .name("sink")
            .caps(
                &gst_video::VideoCapsBuilder::new()
                    .format(gst_video::VideoFormat::Rgba)
                    .build(),
            )
            .build();

        pipeline
            .add_many([&src, &convert, &scale, appsink.upcast_ref()])
            .context("Failed to add elements to pipeline")?;
        gst::Element::link_many([&convert, &scale, appsink.upcast_ref()])
            .context("Failed to link elements")?;

        // uridecodebin exposes pads late; link the video pad when it shows up.
        let convert_weak = convert.downgrade();
        src.connect_pad_added(move |_src, src_pad| {
            let Some(convert) = convert_weak.upgrade() else {
                return;
            };
            let sink_pad = convert.static_pad("sink").expect("convert has no sink pad");
            if sink_pad.is_linked() {
                return;
            }
            let caps = src_pad
                .current_caps()
                .unwrap_or_else(|| src_pad.query_caps(None));
            let Some(structure) = caps.structure(0) else {
                return;
            };
            if structure.name().starts_with("video/") {
                if let Err(e) = src_pad.link(&sink_pad) {
                    tracing::error!("Failed to link pads: {:?}", e);
                }
            }
        });

        let frame_slot = self.current_frame.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let video_info =
                        gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let frame = VideoFrame {
                        pixels: map.as_slice().to_vec(),
                        width: video_info.width(),
                        height: video_info.height(),
                    };
                    if let Ok(mut guard) = frame_slot.lock() {
                        *guard = Some(frame);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let events = self.events.clone();
        let looping = self.looping.clone();
        let pipeline_weak = pipeline.downgrade();
        let bus = pipeline.bus().ok_or_else(|| anyhow!("Pipeline has no bus"))?;
        let guard = bus
            .add_watch(move |_bus, msg| {
                match msg.view() {
                    gst::MessageView::Eos(_) => {
                        if looping.load(Ordering::SeqCst) {
                            if let Some(pipeline) = pipeline_weak.upgrade() {
                                let _ = pipeline.seek_simple(
                                    gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                                    gst::ClockTime::ZERO,
                                );
                            }
                        } else {
                            let _ = events.send(SinkEvent::Ended);
                        }
                    }
                    gst::MessageView::Error(err) => {
                        tracing::error!("GStreamer error: {} ({:?})", err.error(), err.debug());
                        let _ = events.send(SinkEvent::Error(err.error().to_string()));
                    }
                    gst::MessageView::AsyncDone(_) => {
                        let _ = events.send(SinkEvent::Prerolled);
                    }
                    gst::MessageView::StateChanged(change) => {
                        let from_pipeline = msg
                            .src()
                            .map(|s| s.type_().is_a(gst::Pipeline::static_type()))
                            .unwrap_or(false);
                        if from_pipeline {
                            match change.current() {
                                gst::State::Playing => {
                                    let _ = events.send(SinkEvent::Playing);
                                }
                                gst::State::Paused => {
                                    let _ = events.send(SinkEvent::Paused);
                                }
                                _ => {}
                            }
                        }
                    }
                    gst::MessageView::Buffering(buffering) => {
                        if buffering.percent() < 100 {
                            let _ = events.send(SinkEvent::Stalled);
                        }
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .context("Failed to add bus watch")?;

        self.pipeline = Some(pipeline);
        self.bus_watch_guard = Some(guard);
        Ok(())
    }

    fn pipeline(&self) -> Result<&gst::Pipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("No media loaded"))
    }
}

impl Default for GstSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSink for GstSink {
    fn load(&mut self, source: &MediaSource) -> Result<()> {
        self.detach();
        let uri = source_uri(source)?;
        tracing::debug!("Loading media: {}", uri);
        self.build_pipeline(&uri)?;
        // Preroll so the first frame is ready before play is requested.
        self.pipeline()?
            .set_state(gst::State::Paused)
            .context("Failed to preroll pipeline")?;
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.pipeline()?
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to playing")?;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.pipeline()?
            .set_state(gst::State::Paused)
            .context("Failed to set pipeline to paused")?;
        Ok(())
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.pipeline()?
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::from_nseconds(position.as_nanos() as u64),
            )
            .context("Failed to seek")?;
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        self.pipeline
            .as_ref()?
            .query_position::<gst::ClockTime>()
            .map(|p| Duration::from_nanos(p.nseconds()))
    }

    fn set_looping(&mut self, looping: bool) {
        self.looping.store(looping, Ordering::SeqCst);
    }

    fn frame_handle(&self) -> Arc<Mutex<Option<VideoFrame>>> {
        self.current_frame.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events.subscribe()
    }

    fn detach(&mut self) {
        self.bus_watch_guard = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        if let Ok(mut guard) = self.current_frame.lock() {
            *guard = None;
        }
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Creates one `GstSink` per view.
pub struct GstSinkFactory;

impl crate::media::SinkFactory for GstSinkFactory {
    fn create(&self) -> Result<Box<dyn MediaSink>> {
        Ok(Box::new(GstSink::new()))
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Prerolls a downloaded file through playbin with fake outputs, proving the
/// decoder can play it and reading its duration.
pub struct GstProbe;

impl GstProbe {
    fn preroll(path: &Path) -> Result<ProbeInfo> {
        let uri = source_uri(&MediaSource::Local(path.to_path_buf()))?;
        let playbin = gst::ElementFactory::make("playbin")
            .property("uri", &uri)
            .build()
            .context("Failed to create playbin")?;
        for sink_property in ["video-sink", "audio-sink"] {
            let fakesink = gst::ElementFactory::make("fakesink")
                .build()
                .context("Failed to create fakesink")?;
            playbin.set_property(sink_property, &fakesink);
        }

        playbin
            .set_state(gst::State::Paused)
            .context("Failed to preroll probe")?;

        let bus = playbin.bus().ok_or_else(|| anyhow!("Probe has no bus"))?;
        let result = (|| {
            let Some(msg) = bus.timed_pop_filtered(
                Some(gst::ClockTime::from_seconds(PROBE_TIMEOUT.as_secs())),
                &[gst::MessageType::AsyncDone, gst::MessageType::Error],
            ) else {
                return Err(anyhow!("decoder preroll timed out"));
            };
            match msg.view() {
                gst::MessageView::Error(err) => Err(anyhow!("decoder rejected media: {}", err.error())),
                _ => {
                    let duration = playbin
                        .query_duration::<gst::ClockTime>()
                        .map(|d| Duration::from_nanos(d.nseconds()));
                    Ok(ProbeInfo { duration })
                }
            }
        })();

        let _ = playbin.set_state(gst::State::Null);
        result
    }
}

impl DecodeProbe for GstProbe {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<ProbeInfo>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || Self::preroll(&path))
                .await
                .context("probe task failed")?
        })
    }
}
