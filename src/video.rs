//! GStreamer-backed playback surface.
//!
//! Streams play through `playbin`; cached blobs play from their cache file,
//! or from memory through an `appsrc` when the file is gone. End of stream
//! and pipeline errors both resolve the [`EndOfMedia`] receiver.

use crate::assets::{Attachment, MediaKind, PlaybackSource};
use crate::error::{ViewerError, ViewerResult};
use crate::surface::{EndOfMedia, MediaSurface};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::thread;
use tokio::sync::oneshot;

const BUS_POLL_MS: u64 = 250;

pub struct GstSurface {
    pipeline: Option<gst::Element>,
    fullscreen: bool,
}

impl GstSurface {
    /// Initialize GStreamer (call once at startup).
    pub fn init() -> ViewerResult<Self> {
        gst::init().map_err(|e| ViewerError::Playback(format!("GStreamer init failed: {e}")))?;
        tracing::info!("GStreamer initialized: {}", gst::version_string());
        Ok(Self {
            pipeline: None,
            fullscreen: false,
        })
    }

    fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }

    fn start(&mut self, pipeline: gst::Element) -> ViewerResult<EndOfMedia> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| ViewerError::Playback("pipeline has no bus".into()))?;
        let (tx, rx) = oneshot::channel();
        watch_bus(bus, tx);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ViewerError::Playback(format!("failed to start pipeline: {e}")))?;
        self.pipeline = Some(pipeline);
        Ok(rx)
    }
}

/// Forward end-of-stream (or a fatal error) to `tx`. Stops polling once the
/// receiving side is dropped.
fn watch_bus(bus: gst::Bus, tx: oneshot::Sender<()>) {
    thread::spawn(move || loop {
        if tx.is_closed() {
            return;
        }
        let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL_MS)) else {
            continue;
        };
        match msg.view() {
            gst::MessageView::Eos(_) => {
                let _ = tx.send(());
                return;
            }
            gst::MessageView::Error(err) => {
                tracing::error!("GStreamer error: {} ({:?})", err.error(), err.debug());
                let _ = tx.send(());
                return;
            }
            _ => {}
        }
    });
}

fn playbin() -> ViewerResult<gst::Element> {
    gst::ElementFactory::make("playbin")
        .name("player")
        .build()
        .map_err(|e| ViewerError::Playback(format!("failed to create playbin: {e}")))
}

fn file_uri(path: &std::path::Path) -> Option<String> {
    url::Url::from_file_path(path).ok().map(|u| u.to_string())
}

impl MediaSurface for GstSurface {
    fn show_image(&mut self, item: &Attachment, source: &PlaybackSource) -> ViewerResult<()> {
        self.stop();
        let description = format!(
            "uridecodebin uri=\"{}\" ! imagefreeze ! videoconvert ! autovideosink",
            source.url().replace('"', "%22")
        );
        let pipeline = gst::parse::launch(&description)
            .map_err(|e| ViewerError::Playback(format!("image pipeline for {}: {e}", item.id)))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ViewerError::Playback(format!("failed to show image: {e}")))?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn play_stream(
        &mut self,
        item: &Attachment,
        kind: MediaKind,
        source: PlaybackSource,
    ) -> ViewerResult<EndOfMedia> {
        self.stop();
        tracing::debug!(item_id = %item.id, kind = kind.as_str(), "Creating playbin");
        let player = playbin()?;

        match source {
            PlaybackSource::Url(url) => player.set_property("uri", url.as_str()),
            PlaybackSource::Blob { bytes, path, .. } => {
                match path.filter(|p| p.exists()).as_deref().and_then(file_uri) {
                    Some(uri) => player.set_property("uri", uri.as_str()),
                    None => {
                        player.set_property("uri", "appsrc://");
                        player.connect("source-setup", false, move |values| {
                            let appsrc = values
                                .get(1)
                                .and_then(|v| v.get::<gst::Element>().ok())
                                .and_then(|e| e.downcast::<gst_app::AppSrc>().ok());
                            if let Some(appsrc) = appsrc {
                                let _ = appsrc.push_buffer(gst::Buffer::from_slice(bytes.clone()));
                                let _ = appsrc.end_of_stream();
                            }
                            None
                        });
                    }
                }
            }
        }

        self.start(player)
    }

    fn freeze_last_frame(&mut self) {
        // A paused pipeline keeps its last rendered frame on screen.
        if let Some(pipeline) = &self.pipeline {
            let _ = pipeline.set_state(gst::State::Paused);
        }
    }

    fn show_placeholder(&mut self, item: &Attachment) {
        self.stop();
        tracing::warn!(item_id = %item.id, "No media found");
    }

    fn clear(&mut self) {
        self.stop();
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
        tracing::info!("Fullscreen {}", if fullscreen { "on" } else { "off" });
    }
}

impl Drop for GstSurface {
    fn drop(&mut self) {
        self.stop();
    }
}
