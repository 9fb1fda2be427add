//! GStreamer pipeline adapter.
//!
//! Wraps one media pipeline behind the [`MediaPipeline`] trait: static
//! topology `filesrc -> decodebin` and `videoconvert -> videoscale -> video
//! sink` wired eagerly, audio/video pads linked dynamically once the demuxer
//! announces the streams it found. Bus messages are normalized into
//! [`PipelineEvent`]s and forwarded to the controller's event channel.

use anyhow::{Context, Result, anyhow};
use gstreamer as gst;
use gstreamer::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use crate::controller::ControllerEvent;

/// Candidate video sinks, hardware-accelerated first.
const VIDEO_SINKS: &[&str] = &["xvimagesink", "ximagesink"];

/// Candidate audio sinks, system mixer first.
const AUDIO_SINKS: &[&str] = &["pulsesink", "autoaudiosink"];

/// Asynchronous pipeline events, already normalized for the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    EndOfStream,
    Error { message: String },
}

/// Playback primitives of a single active pipeline.
pub trait MediaPipeline {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn set_volume(&mut self, volume: f64) -> Result<()>;
    fn seek_to_start(&mut self) -> Result<()>;
}

/// Builds pipelines. The controller owns one factory for its lifetime.
pub trait PipelineFactory {
    type Pipeline: MediaPipeline;

    /// Build a pipeline for `location`, pre-wired with `volume`.
    ///
    /// Bus events from the built pipeline are reported tagged with
    /// `generation` so events from a superseded pipeline can be told apart.
    fn build(&mut self, location: &Path, volume: f64, generation: u64) -> Result<Self::Pipeline>;
}

/// Resolve a configured URI to a local path.
///
/// The `file://` scheme prefix is stripped; anything else is taken as a
/// plain path. An empty URI resolves to `None`.
pub fn location_from_uri(uri: &str) -> Option<PathBuf> {
    let location = uri.strip_prefix("file://").unwrap_or(uri);
    if location.is_empty() {
        None
    } else {
        Some(PathBuf::from(location))
    }
}

/// Initialize GStreamer (idempotent, safe to call multiple times)
fn initialize_gstreamer() {
    static GSTREAMER_INITIALIZED: std::sync::Once = std::sync::Once::new();

    GSTREAMER_INITIALIZED.call_once(|| {
        gst::init().expect("Failed to initialize GStreamer");
        log::info!("GStreamer initialized");
    });
}

fn make_element(factory: &str, name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .with_context(|| format!("Failed to create '{}' element", factory))
}

/// First candidate that instantiates wins; a role with no usable candidate
/// fails the whole build.
fn make_with_fallback(candidates: &[&str], name: &str) -> Result<gst::Element> {
    for factory in candidates {
        match gst::ElementFactory::make(factory).name(name).build() {
            Ok(element) => {
                log::debug!("Using '{}' as {}", factory, name);
                return Ok(element);
            }
            Err(_) => log::debug!("'{}' unavailable for {}", factory, name),
        }
    }
    Err(anyhow!(
        "No usable element for {} (tried {})",
        name,
        candidates.join(", ")
    ))
}

/// Not every audio sink exposes a volume control (autoaudiosink does not).
fn apply_volume(audio_sink: &gst::Element, volume: f64) {
    if audio_sink.has_property("volume") {
        audio_sink.set_property("volume", volume.clamp(0.0, 1.0));
    } else {
        log::debug!("Audio sink has no volume property, ignoring volume");
    }
}

pub struct GstPipelineFactory {
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl GstPipelineFactory {
    pub fn new(events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self { events }
    }
}

impl PipelineFactory for GstPipelineFactory {
    type Pipeline = GstPipeline;

    fn build(&mut self, location: &Path, volume: f64, generation: u64) -> Result<GstPipeline> {
        GstPipeline::build(location, volume, generation, self.events.clone())
    }
}

/// One active GStreamer pipeline plus its bus watcher thread.
pub struct GstPipeline {
    pipeline: gst::Pipeline,
    audio_sink: gst::Element,
    watcher_stop: Arc<AtomicBool>,
    bus_watcher: Option<JoinHandle<()>>,
}

impl GstPipeline {
    fn build(
        location: &Path,
        volume: f64,
        generation: u64,
        events: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Result<Self> {
        initialize_gstreamer();

        log::info!("Building pipeline for: {}", location.display());
        let pipeline = gst::Pipeline::with_name("video-wallpaper");

        let source = make_element("filesrc", "source")?;
        let demuxer = make_element("decodebin", "demuxer")?;
        let video_convert = make_element("videoconvert", "video-convert")?;
        let video_scale = make_element("videoscale", "video-scale")?;
        let video_sink = make_with_fallback(VIDEO_SINKS, "video-sink")?;
        let audio_sink = make_with_fallback(AUDIO_SINKS, "audio-sink")?;

        source.set_property("location", location.to_string_lossy().as_ref());
        // The wallpaper surface dictates geometry; the video fills it.
        video_sink.set_property("force-aspect-ratio", false);
        apply_volume(&audio_sink, volume);

        pipeline
            .add_many([
                &source,
                &demuxer,
                &video_convert,
                &video_scale,
                &video_sink,
                &audio_sink,
            ])
            .context("Failed to add elements to pipeline")?;

        source
            .link(&demuxer)
            .context("Failed to link source to demuxer")?;
        gst::Element::link_many([&video_convert, &video_scale, &video_sink])
            .context("Failed to link video conversion chain")?;

        // The demuxer's output pads only exist once it has started parsing
        // the container; link each stream to its branch as it appears.
        let video_convert_weak = video_convert.downgrade();
        let audio_sink_weak = audio_sink.downgrade();
        demuxer.connect_pad_added(move |_demuxer, src_pad| {
            let caps = src_pad
                .current_caps()
                .unwrap_or_else(|| src_pad.query_caps(None));
            let Some(structure) = caps.structure(0) else {
                return;
            };
            let media_type = structure.name();

            let target = if media_type.starts_with("video") {
                video_convert_weak.upgrade()
            } else if media_type.starts_with("audio") {
                audio_sink_weak.upgrade()
            } else {
                None
            };
            let Some(target) = target else {
                return;
            };
            let Some(sink_pad) = target.static_pad("sink") else {
                log::warn!("{} has no sink pad", target.name());
                return;
            };
            if sink_pad.is_linked() {
                return;
            }
            match src_pad.link(&sink_pad) {
                Ok(_) => log::debug!("Linked {} pad", media_type),
                Err(e) => log::warn!("Failed to link {} pad: {:?}", media_type, e),
            }
        });

        let bus = pipeline.bus().context("Pipeline has no bus")?;
        let watcher_stop = Arc::new(AtomicBool::new(false));
        let bus_watcher = spawn_bus_watcher(bus, generation, events, watcher_stop.clone());

        Ok(Self {
            pipeline,
            audio_sink,
            watcher_stop,
            bus_watcher: Some(bus_watcher),
        })
    }
}

impl MediaPipeline for GstPipeline {
    fn play(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to Playing state")?;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Paused)
            .context("Failed to set pipeline to Paused state")?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .context("Failed to set pipeline to Null state")?;
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        apply_volume(&self.audio_sink, volume);
        Ok(())
    }

    fn seek_to_start(&mut self) -> Result<()> {
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::ZERO,
            )
            .context("Failed to seek to start")?;
        Ok(())
    }
}

impl Drop for GstPipeline {
    fn drop(&mut self) {
        // Teardown must complete before any rebuild proceeds: set_state(Null)
        // is synchronous here, then the watcher thread is joined.
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("Failed to set pipeline state to Null: {}", e);
        }

        self.watcher_stop.store(true, Ordering::Relaxed);
        if let Some(bus) = self.pipeline.bus() {
            bus.set_flushing(true);
        }
        if let Some(watcher) = self.bus_watcher.take() {
            let _ = watcher.join();
        }

        log::debug!("Pipeline released");
    }
}

/// Pump the pipeline bus on a dedicated thread, forwarding normalized
/// EOS/error messages into the controller's event channel.
///
/// The short pop timeout mirrors the IPC accept loop: it bounds how long the
/// thread outlives a teardown request.
fn spawn_bus_watcher(
    bus: gst::Bus,
    generation: u64,
    events: mpsc::UnboundedSender<ControllerEvent>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                continue;
            };

            let event = match message.view() {
                gst::MessageView::Eos(_) => PipelineEvent::EndOfStream,
                gst::MessageView::Error(err) => PipelineEvent::Error {
                    message: normalize_error(err),
                },
                _ => continue,
            };

            if events
                .send(ControllerEvent::Pipeline { generation, event })
                .is_err()
            {
                // Controller is gone; nothing left to report to.
                break;
            }
        }
    })
}

/// Flatten a bus error message into one loggable line.
fn normalize_error(err: &gst::message::Error) -> String {
    match err.debug() {
        Some(debug) => format!("{} ({})", err.error(), debug),
        None => err.error().to_string(),
    }
}
