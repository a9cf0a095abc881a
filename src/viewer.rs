//! Mountable group viewer: playlist sync feeding the group player.

use crate::api::{ApiClient, MediaFetcher};
use crate::assets::{Attachment, MediaResolver, RetrievalMode};
use crate::cache::ByteCache;
use crate::config::ViewerConfig;
use crate::group::{GroupPlayer, Position};
use crate::player::PlayerContext;
use crate::realtime::{PlaylistSnapshot, PlaylistSync, PushTransport, SyncCore, WsTransport};
use crate::surface::{MediaSurface, SurfaceHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Collaborators a viewer runs against.
pub struct ViewerServices {
    pub resolver: Arc<MediaResolver>,
    pub cache: Option<Arc<ByteCache>>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub transport: Arc<dyn PushTransport>,
    pub image_duration: Duration,
    pub unplayable_skip: Option<Duration>,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_attempts: u32,
}

impl ViewerServices {
    /// Production wiring. An unusable cache directory disables caching for
    /// the session instead of failing.
    pub async fn from_config(config: &ViewerConfig) -> Self {
        let api = Arc::new(ApiClient::new(&config.api_base, config.auth_token.clone()));
        let resolver = match config.retrieval_mode {
            RetrievalMode::Direct => MediaResolver::direct(&config.api_base),
            RetrievalMode::Signed => MediaResolver::signed(&config.api_base, api.clone()),
        };

        let cache = if config.cache_enabled {
            let cache = ByteCache::new(&config.cache_dir, config.cache_memory_entries)
                .with_memory_budget(config.cache_memory_bytes);
            match cache.open().await {
                Ok(()) => Some(Arc::new(cache)),
                Err(e) => {
                    tracing::warn!("Caching disabled for this session: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            resolver: Arc::new(resolver),
            cache,
            fetcher: api,
            transport: Arc::new(WsTransport::new(&config.push_url, config.auth_token.clone())),
            image_duration: config.image_duration(),
            unplayable_skip: config.unplayable_skip(),
            reconnect_base_delay: config.reconnect_base_delay(),
            reconnect_max_attempts: config.reconnect_max_attempts,
        }
    }
}

pub struct Viewer;

impl Viewer {
    /// Seed the playlist with `initial`, subscribe to `group_key` and start
    /// playing on `surface`.
    pub fn mount(
        initial: Vec<Attachment>,
        group_key: impl Into<String>,
        services: ViewerServices,
        surface: impl MediaSurface + 'static,
    ) -> ViewerHandle {
        let group_key = group_key.into();
        tracing::info!(group_key = %group_key, items = initial.len(), "Mounting viewer");

        let core = SyncCore::new(
            group_key,
            initial,
            services.reconnect_base_delay,
            services.reconnect_max_attempts,
        );
        let sync = PlaylistSync::spawn(core, services.transport);

        let surface = SurfaceHandle::new(surface);
        let ctx = Arc::new(PlayerContext::new(
            services.resolver,
            services.cache,
            services.fetcher,
            services.image_duration,
            services.unplayable_skip,
        ));

        let updates = sync.subscribe();
        let (player, finished) = GroupPlayer::new(&updates.borrow(), ctx, surface.clone());
        let position = player.position();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(player.run(updates, finished, shutdown_rx));

        ViewerHandle {
            sync,
            surface,
            position,
            task,
            shutdown: Some(shutdown_tx),
            fullscreen: false,
        }
    }
}

/// Host-side handle. Dropping it stops the viewer.
pub struct ViewerHandle {
    sync: PlaylistSync,
    surface: SurfaceHandle,
    position: watch::Receiver<Position>,
    task: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
    fullscreen: bool,
}

impl ViewerHandle {
    pub fn playlist(&self) -> PlaylistSnapshot {
        self.sync.snapshot()
    }

    pub fn playlist_updates(&self) -> watch::Receiver<PlaylistSnapshot> {
        self.sync.subscribe()
    }

    pub fn position(&self) -> watch::Receiver<Position> {
        self.position.clone()
    }

    /// Background caching in progress for the item on screen.
    pub fn caching(&self) -> watch::Receiver<bool> {
        self.surface.caching()
    }

    pub fn set_group_key(&self, key: impl Into<String>) {
        self.sync.set_group_key(key);
    }

    pub fn toggle_fullscreen(&mut self) -> bool {
        self.fullscreen = !self.fullscreen;
        self.surface.set_fullscreen(self.fullscreen);
        self.fullscreen
    }

    /// Stop playback and the subscription, waiting for the player to release
    /// the surface.
    pub async fn shutdown(mut self) {
        self.sync.stop();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!("Group player ended abnormally: {}", e);
        }
    }
}
