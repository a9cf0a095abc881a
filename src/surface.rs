//! Playback surface: the element media is drawn on.
//!
//! Only one mount owns the surface at a time. [`SurfaceHandle`] hands out
//! generations; calls made with an outdated generation are dropped, so an
//! abandoned mount can never draw over its successor.

use crate::assets::{Attachment, MediaKind, PlaybackSource};
use crate::error::ViewerResult;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Resolves when the loaded stream reaches its end.
pub type EndOfMedia = oneshot::Receiver<()>;

pub trait MediaSurface: Send {
    /// Show a still image. Advancing is timed by the caller.
    fn show_image(&mut self, item: &Attachment, source: &PlaybackSource) -> ViewerResult<()>;

    /// Start audio or video playback of `source`.
    fn play_stream(
        &mut self,
        item: &Attachment,
        kind: MediaKind,
        source: PlaybackSource,
    ) -> ViewerResult<EndOfMedia>;

    /// Keep the final frame on screen until the next item replaces it.
    fn freeze_last_frame(&mut self);

    /// "No media found" state for an unplayable item.
    fn show_placeholder(&mut self, item: &Attachment);

    /// Blank the surface; nothing is playing.
    fn clear(&mut self);

    fn set_caching(&mut self, _caching: bool) {}

    fn set_fullscreen(&mut self, _fullscreen: bool) {}
}

struct Slot {
    surface: Box<dyn MediaSurface>,
    live: u64,
}

/// Shared, generation-checked access to the surface.
#[derive(Clone)]
pub struct SurfaceHandle {
    slot: Arc<Mutex<Slot>>,
    caching: Arc<watch::Sender<bool>>,
}

impl SurfaceHandle {
    pub fn new(surface: impl MediaSurface + 'static) -> Self {
        let (caching, _) = watch::channel(false);
        Self {
            slot: Arc::new(Mutex::new(Slot {
                surface: Box::new(surface),
                live: 0,
            })),
            caching: Arc::new(caching),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand the surface to a new mount, invalidating the previous one.
    pub fn begin_mount(&self) -> u64 {
        let mut slot = self.lock();
        slot.live += 1;
        slot.surface.set_caching(false);
        self.caching.send_replace(false);
        slot.live
    }

    /// Invalidate the current mount and blank the surface.
    pub fn release(&self) {
        let mut slot = self.lock();
        slot.live += 1;
        slot.surface.set_caching(false);
        slot.surface.clear();
        self.caching.send_replace(false);
    }

    pub fn is_live(&self, generation: u64) -> bool {
        self.lock().live == generation
    }

    /// Run `f` only if `generation` still owns the surface.
    pub fn with<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut dyn MediaSurface) -> R,
    ) -> Option<R> {
        let mut slot = self.lock();
        if slot.live != generation {
            return None;
        }
        Some(f(slot.surface.as_mut()))
    }

    /// Update the caching indicator for `generation`, if it is still live.
    pub fn set_caching(&self, generation: u64, caching: bool) {
        let mut slot = self.lock();
        if slot.live == generation {
            slot.surface.set_caching(caching);
            self.caching.send_replace(caching);
        }
    }

    pub fn caching(&self) -> watch::Receiver<bool> {
        self.caching.subscribe()
    }

    pub fn set_fullscreen(&self, fullscreen: bool) {
        self.lock().surface.set_fullscreen(fullscreen);
    }
}

/// Surface for machines without a display: logs what would be shown and
/// ends every stream after a fixed clip length.
pub struct HeadlessSurface {
    clip: Duration,
    current: Option<String>,
}

impl HeadlessSurface {
    pub fn new(clip: Duration) -> Self {
        Self {
            clip,
            current: None,
        }
    }
}

impl MediaSurface for HeadlessSurface {
    fn show_image(&mut self, item: &Attachment, source: &PlaybackSource) -> ViewerResult<()> {
        tracing::info!(item_id = %item.id, url = source.url(), "Showing image");
        self.current = Some(item.id.clone());
        Ok(())
    }

    fn play_stream(
        &mut self,
        item: &Attachment,
        kind: MediaKind,
        source: PlaybackSource,
    ) -> ViewerResult<EndOfMedia> {
        tracing::info!(
            item_id = %item.id,
            kind = kind.as_str(),
            cached = source.is_cached(),
            "Playing {}",
            source.url()
        );
        self.current = Some(item.id.clone());

        let (mut tx, rx) = oneshot::channel();
        let clip = self.clip;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(clip) => {
                    let _ = tx.send(());
                }
                _ = tx.closed() => {}
            }
        });
        Ok(rx)
    }

    fn freeze_last_frame(&mut self) {
        tracing::debug!("Holding last frame of {:?}", self.current);
    }

    fn show_placeholder(&mut self, item: &Attachment) {
        tracing::warn!(item_id = %item.id, "No media found");
        self.current = None;
    }

    fn clear(&mut self) {
        self.current = None;
    }

    fn set_caching(&mut self, caching: bool) {
        if caching {
            tracing::debug!("Caching {:?} in background", self.current);
        }
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        tracing::info!("Fullscreen {}", if fullscreen { "on" } else { "off" });
    }
}
