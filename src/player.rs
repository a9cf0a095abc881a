//! Single-item playback.
//!
//! A mount plays exactly one attachment and reports completion once:
//! after a fixed delay for images, on end of media for audio and video.
//! Videos are served from the byte cache when possible; on a miss the
//! network URL plays immediately while the bytes are fetched into the
//! cache in the background.

use crate::api::MediaFetcher;
use crate::assets::{Attachment, MediaKind, MediaResolver, PlaybackSource};
use crate::cache::ByteCache;
use crate::surface::SurfaceHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Services shared by every mount.
pub struct PlayerContext {
    pub resolver: Arc<MediaResolver>,
    /// `None` when persistent storage is unavailable this session.
    pub cache: Option<Arc<ByteCache>>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub image_duration: Duration,
    pub unplayable_skip: Option<Duration>,
    /// URLs with a background fetch already running. The receiver closes
    /// when that fetch ends.
    inflight: Mutex<HashMap<String, watch::Receiver<()>>>,
}

enum FetchClaim {
    /// This mount runs the fetch; drop the sender when it ends.
    Claimed(watch::Sender<()>),
    /// Another mount's fetch for the same URL is still running.
    Running(watch::Receiver<()>),
}

impl PlayerContext {
    pub fn new(
        resolver: Arc<MediaResolver>,
        cache: Option<Arc<ByteCache>>,
        fetcher: Arc<dyn MediaFetcher>,
        image_duration: Duration,
        unplayable_skip: Option<Duration>,
    ) -> Self {
        Self {
            resolver,
            cache,
            fetcher,
            image_duration,
            unplayable_skip,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<()>>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim_fetch(&self, url: &str) -> FetchClaim {
        let mut inflight = self.inflight();
        if let Some(done) = inflight.get(url) {
            return FetchClaim::Running(done.clone());
        }
        let (tx, rx) = watch::channel(());
        inflight.insert(url.to_string(), rx);
        FetchClaim::Claimed(tx)
    }

    fn release_fetch(&self, url: &str) {
        self.inflight().remove(url);
    }
}

/// Completion report from a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub generation: u64,
    pub item_id: String,
}

enum Outcome {
    Completed,
    Unplayable,
    /// The surface moved on to another mount.
    Abandoned,
}

/// A live mount. Dropping it abandons playback; background caching it
/// started keeps running.
pub struct Mount {
    item_id: String,
    generation: u64,
    task: JoinHandle<()>,
}

impl Mount {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct MediaPlayer {
    item: Attachment,
    generation: u64,
    ctx: Arc<PlayerContext>,
    surface: SurfaceHandle,
}

impl MediaPlayer {
    /// Take over the surface and start playing `item`.
    pub fn mount(
        item: Attachment,
        ctx: Arc<PlayerContext>,
        surface: SurfaceHandle,
        finished: mpsc::UnboundedSender<Finished>,
    ) -> Mount {
        let generation = surface.begin_mount();
        let item_id = item.id.clone();
        tracing::debug!(item_id = %item_id, generation, "Mounting media player");

        let player = MediaPlayer {
            item,
            generation,
            ctx,
            surface,
        };
        let task = tokio::spawn(player.run(finished));

        Mount {
            item_id,
            generation,
            task,
        }
    }

    async fn run(self, finished: mpsc::UnboundedSender<Finished>) {
        let outcome = self.play().await;

        match outcome {
            Outcome::Completed => {}
            Outcome::Abandoned => return,
            Outcome::Unplayable => {
                if self
                    .surface
                    .with(self.generation, |s| s.show_placeholder(&self.item))
                    .is_none()
                {
                    return;
                }
                match self.ctx.unplayable_skip {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        tracing::info!(item_id = %self.item.id, "Unplayable item, holding");
                        return;
                    }
                }
            }
        }

        let _ = finished.send(Finished {
            generation: self.generation,
            item_id: self.item.id.clone(),
        });
    }

    async fn play(&self) -> Outcome {
        let kind = self.ctx.resolver.kind(&self.item);
        tracing::debug!(item_id = %self.item.id, kind = kind.as_str(), "Resolved media kind");
        if kind == MediaKind::Unknown {
            return Outcome::Unplayable;
        }

        let url = match self.ctx.resolver.source_url(&self.item).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(item_id = %self.item.id, "No playable source: {}", e);
                return Outcome::Unplayable;
            }
        };

        if kind == MediaKind::Image {
            return self.show_image(url).await;
        }

        let source = if kind == MediaKind::Video {
            self.video_source(url).await
        } else {
            PlaybackSource::Url(url)
        };
        self.play_stream(kind, source).await
    }

    async fn show_image(&self, url: String) -> Outcome {
        let source = PlaybackSource::Url(url);
        match self
            .surface
            .with(self.generation, |s| s.show_image(&self.item, &source))
        {
            None => Outcome::Abandoned,
            Some(Err(e)) => {
                tracing::warn!(item_id = %self.item.id, "Image rejected: {}", e);
                Outcome::Unplayable
            }
            Some(Ok(())) => {
                tokio::time::sleep(self.ctx.image_duration).await;
                Outcome::Completed
            }
        }
    }

    async fn play_stream(&self, kind: MediaKind, source: PlaybackSource) -> Outcome {
        let ended = match self
            .surface
            .with(self.generation, |s| s.play_stream(&self.item, kind, source))
        {
            None => return Outcome::Abandoned,
            Some(Err(e)) => {
                tracing::warn!(item_id = %self.item.id, "Playback failed to start: {}", e);
                return Outcome::Unplayable;
            }
            Some(Ok(ended)) => ended,
        };

        if ended.await.is_err() && !self.surface.is_live(self.generation) {
            return Outcome::Abandoned;
        }

        // Hold the last frame while the next item loads instead of replaying.
        match self
            .surface
            .with(self.generation, |s| s.freeze_last_frame())
        {
            Some(()) => Outcome::Completed,
            None => Outcome::Abandoned,
        }
    }

    /// Cached bytes if present, otherwise the network URL plus a background
    /// fetch that fills the cache.
    async fn video_source(&self, url: String) -> PlaybackSource {
        let Some(cache) = self.ctx.cache.clone() else {
            return PlaybackSource::Url(url);
        };

        match cache.get(&url).await {
            Ok(Some(bytes)) => {
                tracing::debug!(item_id = %self.item.id, "Video served from cache");
                let path = Some(cache.path_for(&url));
                return PlaybackSource::Blob { url, bytes, path };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Cache lookup failed, playing uncached: {}", e);
                return PlaybackSource::Url(url);
            }
        }

        match self.ctx.claim_fetch(&url) {
            FetchClaim::Claimed(done) => self.spawn_background_cache(cache, url.clone(), done),
            FetchClaim::Running(done) => self.follow_background_cache(done),
        }
        PlaybackSource::Url(url)
    }

    /// Show the indicator for a fetch an earlier mount started.
    fn follow_background_cache(&self, mut done: watch::Receiver<()>) {
        let surface = self.surface.clone();
        let generation = self.generation;

        surface.set_caching(generation, true);
        tokio::spawn(async move {
            // Only ever resolves once the fetching task drops its sender.
            let _ = done.changed().await;
            surface.set_caching(generation, false);
        });
    }

    fn spawn_background_cache(
        &self,
        cache: Arc<ByteCache>,
        url: String,
        done: watch::Sender<()>,
    ) {
        let ctx = self.ctx.clone();
        let surface = self.surface.clone();
        let generation = self.generation;
        let item_id = self.item.id.clone();

        surface.set_caching(generation, true);
        tokio::spawn(async move {
            match ctx.fetcher.fetch_bytes(&url).await {
                Ok(bytes) => {
                    tracing::debug!(item_id = %item_id, "Fetched {} bytes for cache", bytes.len());
                    cache.put(&url, bytes).await;
                }
                Err(e) => {
                    tracing::warn!(item_id = %item_id, "Background caching failed: {}", e);
                }
            }
            ctx.release_fetch(&url);
            drop(done);
            surface.set_caching(generation, false);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ViewerError, ViewerResult};
    use crate::surface::{EndOfMedia, MediaSurface};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::{oneshot, Notify};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Image(String),
        Stream { id: String, cached: bool },
        Freeze,
        Placeholder(String),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        enders: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn end_stream(&self) {
            let tx = self.enders.lock().unwrap().remove(0);
            tx.send(()).unwrap();
        }
    }

    impl MediaSurface for Recorder {
        fn show_image(&mut self, item: &Attachment, _source: &PlaybackSource) -> ViewerResult<()> {
            self.calls.lock().unwrap().push(Call::Image(item.id.clone()));
            Ok(())
        }

        fn play_stream(
            &mut self,
            item: &Attachment,
            _kind: MediaKind,
            source: PlaybackSource,
        ) -> ViewerResult<EndOfMedia> {
            self.calls.lock().unwrap().push(Call::Stream {
                id: item.id.clone(),
                cached: source.is_cached(),
            });
            let (tx, rx) = oneshot::channel();
            self.enders.lock().unwrap().push(tx);
            Ok(rx)
        }

        fn freeze_last_frame(&mut self) {
            self.calls.lock().unwrap().push(Call::Freeze);
        }

        fn show_placeholder(&mut self, item: &Attachment) {
            self.calls.lock().unwrap().push(Call::Placeholder(item.id.clone()));
        }

        fn clear(&mut self) {}
    }

    struct StaticFetcher {
        body: Option<&'static [u8]>,
        hits: Arc<Mutex<usize>>,
        gate: Arc<Notify>,
        gated: bool,
    }

    #[async_trait]
    impl MediaFetcher for StaticFetcher {
        async fn fetch_bytes(&self, _url: &str) -> ViewerResult<Bytes> {
            *self.hits.lock().unwrap() += 1;
            if self.gated {
                self.gate.notified().await;
            }
            self.body
                .map(Bytes::from_static)
                .ok_or_else(|| ViewerError::Transport("connection reset".into()))
        }
    }

    fn context(
        cache: Option<Arc<ByteCache>>,
        body: Option<&'static [u8]>,
        skip: Option<Duration>,
    ) -> (Arc<PlayerContext>, Arc<Mutex<usize>>) {
        gated_context(cache, body, skip, None)
    }

    fn gated_context(
        cache: Option<Arc<ByteCache>>,
        body: Option<&'static [u8]>,
        skip: Option<Duration>,
        gate: Option<Arc<Notify>>,
    ) -> (Arc<PlayerContext>, Arc<Mutex<usize>>) {
        let hits = Arc::new(Mutex::new(0));
        let fetcher = StaticFetcher {
            body,
            hits: hits.clone(),
            gated: gate.is_some(),
            gate: gate.unwrap_or_default(),
        };
        let ctx = PlayerContext::new(
            Arc::new(MediaResolver::direct("https://x")),
            cache,
            Arc::new(fetcher),
            Duration::from_secs(5),
            skip,
        );
        (Arc::new(ctx), hits)
    }

    #[tokio::test(start_paused = true)]
    async fn image_finishes_after_fixed_delay() {
        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let (ctx, _) = context(None, None, None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mount = MediaPlayer::mount(Attachment::new("1", "jpg"), ctx, surface, tx);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(rx.try_recv().is_err());

        let done = rx.recv().await.unwrap();
        assert_eq!(done.item_id, "1");
        assert_eq!(done.generation, mount.generation());
        assert_eq!(recorder.calls(), vec![Call::Image("1".into())]);
    }

    #[tokio::test]
    async fn stream_finishes_on_end_of_media_and_freezes() {
        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let (ctx, _) = context(None, None, None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _mount = MediaPlayer::mount(Attachment::new("s", "mp3"), ctx, surface, tx);
        while recorder.enders.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err());

        recorder.end_stream();
        assert_eq!(rx.recv().await.unwrap().item_id, "s");
        assert_eq!(
            recorder.calls(),
            vec![
                Call::Stream {
                    id: "s".into(),
                    cached: false
                },
                Call::Freeze
            ]
        );
        // Exactly one signal.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kind_shows_placeholder_and_never_finishes() {
        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let (ctx, _) = context(None, None, None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _mount = MediaPlayer::mount(Attachment::new("doc", "pdf"), ctx, surface, tx);
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(recorder.calls(), vec![Call::Placeholder("doc".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn unplayable_item_is_skipped_when_configured() {
        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let (ctx, _) = context(None, None, Some(Duration::from_secs(3)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _mount = MediaPlayer::mount(Attachment::new("doc", "pdf"), ctx, surface, tx);
        assert_eq!(rx.recv().await.unwrap().item_id, "doc");
    }

    #[tokio::test]
    async fn video_cache_miss_plays_url_and_fills_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ByteCache::new(dir.path(), 0));
        cache.open().await.unwrap();

        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let mut caching = surface.caching();
        let gate = Arc::new(Notify::new());
        let (ctx, hits) =
            gated_context(Some(cache.clone()), Some(b"video-bytes"), None, Some(gate.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let _mount = MediaPlayer::mount(Attachment::new("v", "mp4"), ctx, surface, tx);

        // Playback starts while the fetch is still held back.
        while recorder.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(*caching.borrow());
        assert!(cache.get("https://x/attachment/v").await.unwrap().is_none());

        gate.notify_one();
        caching.wait_for(|c| !*c).await.unwrap();

        let url = "https://x/attachment/v";
        assert_eq!(cache.get(url).await.unwrap().unwrap(), &b"video-bytes"[..]);
        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(
            recorder.calls()[0],
            Call::Stream {
                id: "v".into(),
                cached: false
            }
        );
    }

    #[tokio::test]
    async fn remount_during_running_fetch_keeps_indicator_until_fetch_ends() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ByteCache::new(dir.path(), 0));
        cache.open().await.unwrap();

        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let mut caching = surface.caching();
        let gate = Arc::new(Notify::new());
        let (ctx, hits) =
            gated_context(Some(cache.clone()), Some(b"video-bytes"), None, Some(gate.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = MediaPlayer::mount(
            Attachment::new("v", "mp4"),
            ctx.clone(),
            surface.clone(),
            tx.clone(),
        );
        while recorder.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(*caching.borrow());

        drop(first);
        let _second = MediaPlayer::mount(Attachment::new("v", "mp4"), ctx, surface, tx);
        while recorder.calls().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(*caching.borrow());
        assert_eq!(*hits.lock().unwrap(), 1);

        gate.notify_one();
        caching.wait_for(|c| !*c).await.unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(
            cache.get("https://x/attachment/v").await.unwrap().unwrap(),
            &b"video-bytes"[..]
        );
    }

    #[tokio::test]
    async fn video_cache_hit_skips_background_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ByteCache::new(dir.path(), 0));
        cache.open().await.unwrap();
        cache
            .put("https://x/attachment/v", Bytes::from_static(b"cached"))
            .await;

        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let caching = surface.caching();
        let (ctx, hits) = context(Some(cache), Some(b"network"), None);
        let (tx, _rx) = mpsc::unbounded_channel();

        let _mount = MediaPlayer::mount(Attachment::new("v", "mp4"), ctx, surface, tx);
        while recorder.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            recorder.calls(),
            vec![Call::Stream {
                id: "v".into(),
                cached: true
            }]
        );
        assert_eq!(*hits.lock().unwrap(), 0);
        assert!(!*caching.borrow());
    }

    #[tokio::test]
    async fn failed_background_fetch_does_not_disturb_playback() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ByteCache::new(dir.path(), 0));
        cache.open().await.unwrap();

        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let (ctx, _) = context(Some(cache.clone()), None, None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _mount = MediaPlayer::mount(Attachment::new("v", "mp4"), ctx, surface, tx);
        while recorder.enders.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        recorder.end_stream();
        assert_eq!(rx.recv().await.unwrap().item_id, "v");
        assert!(cache.get("https://x/attachment/v").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandoned_mount_never_signals() {
        let recorder = Recorder::default();
        let surface = SurfaceHandle::new(recorder.clone());
        let (ctx, _) = context(None, None, None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = MediaPlayer::mount(
            Attachment::new("a", "mp3"),
            ctx.clone(),
            surface.clone(),
            tx.clone(),
        );
        while recorder.enders.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        let _second = MediaPlayer::mount(Attachment::new("b", "jpg"), ctx, surface, tx);
        drop(first);

        // The first stream's end arrives late and must be ignored.
        let _ = recorder.enders.lock().unwrap().remove(0).send(());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
