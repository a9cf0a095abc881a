//! Group playback: position tracking across playlist replacements and
//! completion signals.

use crate::assets::Attachment;
use crate::player::{Finished, MediaPlayer, Mount, PlayerContext};
use crate::realtime::PlaylistSnapshot;
use crate::surface::SurfaceHandle;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// What a playlist replacement means for the item on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The list is empty; nothing is shown.
    Idle,
    /// Same id at the current position; playback continues.
    Continue,
    /// A different item now sits at the current position.
    Restart,
}

/// Playlist plus position. All mutation goes through `replace` and `advance`.
#[derive(Debug, Clone, Default)]
pub struct GroupState {
    playlist: Arc<Vec<Attachment>>,
    index: usize,
}

impl GroupState {
    pub fn new(playlist: Arc<Vec<Attachment>>) -> Self {
        Self { playlist, index: 0 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn playlist(&self) -> &[Attachment] {
        &self.playlist
    }

    pub fn current(&self) -> Option<&Attachment> {
        self.playlist.get(self.index)
    }

    /// Swap in a new list and fix up the position.
    pub fn replace(&mut self, playlist: Arc<Vec<Attachment>>) -> Reconciled {
        let previous = self.current().map(|a| a.id.clone());
        if self.index >= playlist.len() {
            self.index = 0;
        }
        self.playlist = playlist;

        match (previous, self.current()) {
            (_, None) => Reconciled::Idle,
            (Some(previous), Some(current)) if previous == current.id => Reconciled::Continue,
            _ => Reconciled::Restart,
        }
    }

    /// Step to the next item, wrapping. An empty list holds its position.
    pub fn advance(&mut self) -> Option<&Attachment> {
        if self.playlist.is_empty() {
            return None;
        }
        self.index = (self.index + 1) % self.playlist.len();
        self.current()
    }
}

/// Externally visible position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub index: usize,
    pub item_id: Option<String>,
    /// Mount generation showing `item_id`; changes on every (re)start.
    pub generation: Option<u64>,
}

pub struct GroupPlayer {
    state: GroupState,
    revision: u64,
    ctx: Arc<PlayerContext>,
    surface: SurfaceHandle,
    mount: Option<Mount>,
    finished_tx: mpsc::UnboundedSender<Finished>,
    position: watch::Sender<Position>,
}

impl GroupPlayer {
    pub fn new(
        initial: &PlaylistSnapshot,
        ctx: Arc<PlayerContext>,
        surface: SurfaceHandle,
    ) -> (Self, mpsc::UnboundedReceiver<Finished>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (position, _) = watch::channel(Position::default());
        let player = Self {
            state: GroupState::new(initial.playlist.clone()),
            revision: initial.revision,
            ctx,
            surface,
            mount: None,
            finished_tx,
            position,
        };
        (player, finished_rx)
    }

    pub fn position(&self) -> watch::Receiver<Position> {
        self.position.subscribe()
    }

    /// React to playlist updates and finished signals until shutdown.
    ///
    /// Updates are polled first. A finished signal is applied only after
    /// any pending update, and only if it came from the current mount.
    pub async fn run(
        mut self,
        mut playlist: watch::Receiver<PlaylistSnapshot>,
        mut finished: mpsc::UnboundedReceiver<Finished>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let latest = playlist.borrow_and_update().clone();
        self.on_snapshot(latest);
        self.sync_mount();

        let mut sync_open = true;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                changed = playlist.changed(), if sync_open => {
                    if changed.is_err() {
                        tracing::debug!("Playlist sync ended; keeping last list");
                        sync_open = false;
                        continue;
                    }
                    let latest = playlist.borrow_and_update().clone();
                    self.on_snapshot(latest);
                }
                Some(done) = finished.recv() => {
                    if sync_open && playlist.has_changed().unwrap_or(false) {
                        let latest = playlist.borrow_and_update().clone();
                        self.on_snapshot(latest);
                    }
                    self.on_finished(done);
                }
            }
        }

        self.mount = None;
        self.surface.release();
        tracing::info!("Group player stopped");
    }

    fn on_snapshot(&mut self, snapshot: PlaylistSnapshot) {
        if snapshot.revision == self.revision {
            return;
        }
        self.revision = snapshot.revision;

        let outcome = self.state.replace(snapshot.playlist);
        tracing::debug!(
            revision = self.revision,
            len = self.state.playlist().len(),
            index = self.state.index(),
            ?outcome,
            "Playlist replaced"
        );
        self.sync_mount();
    }

    fn on_finished(&mut self, done: Finished) {
        let is_current = self
            .mount
            .as_ref()
            .is_some_and(|m| m.generation() == done.generation);
        if !is_current {
            tracing::debug!(item_id = %done.item_id, "Ignoring finish from abandoned mount");
            return;
        }

        if self.state.advance().is_some() {
            // Always a fresh mount, even when the list wraps onto the same item.
            self.mount = None;
            self.sync_mount();
        }
    }

    /// Make the mount match the item at the current position.
    fn sync_mount(&mut self) {
        let Some(current) = self.state.current().cloned() else {
            if self.mount.take().is_some() {
                self.surface.release();
            }
            self.publish();
            return;
        };

        let unchanged = self
            .mount
            .as_ref()
            .is_some_and(|m| m.item_id() == current.id);
        if !unchanged {
            self.mount = None;
            self.mount = Some(MediaPlayer::mount(
                current,
                self.ctx.clone(),
                self.surface.clone(),
                self.finished_tx.clone(),
            ));
        }
        self.publish();
    }

    fn publish(&self) {
        self.position.send_replace(Position {
            index: self.state.index(),
            item_id: self.mount.as_ref().map(|m| m.item_id().to_string()),
            generation: self.mount.as_ref().map(|m| m.generation()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MediaFetcher;
    use crate::assets::{MediaKind, MediaResolver, PlaybackSource};
    use crate::error::{ViewerError, ViewerResult};
    use crate::realtime::ConnectionState;
    use crate::surface::{EndOfMedia, MediaSurface};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    fn list(ids: &[&str]) -> Arc<Vec<Attachment>> {
        Arc::new(ids.iter().map(|id| Attachment::new(*id, "jpg")).collect())
    }

    fn at(ids: &[&str], index: usize) -> GroupState {
        let mut state = GroupState::new(list(ids));
        while state.index() != index {
            state.advance();
        }
        state
    }

    #[test]
    fn shrink_below_position_resets_to_start() {
        let mut state = at(&["1", "2", "3", "4", "5"], 4);
        let outcome = state.replace(list(&["1", "2", "3"]));
        assert_eq!(state.index(), 0);
        assert_eq!(outcome, Reconciled::Restart);
    }

    #[test]
    fn shrink_onto_same_item_keeps_playing() {
        let mut state = at(&["a", "b", "c"], 2);
        assert_eq!(state.replace(list(&["c"])), Reconciled::Continue);
        assert_eq!(state.index(), 0);
    }

    #[test]
    fn same_id_at_position_continues() {
        let mut state = at(&["a", "b", "c"], 1);
        let outcome = state.replace(list(&["x", "b", "y", "z"]));
        assert_eq!(outcome, Reconciled::Continue);
        assert_eq!(state.index(), 1);
    }

    #[test]
    fn swapped_item_at_position_restarts() {
        let mut state = at(&["a"], 0);
        assert_eq!(state.replace(list(&["b"])), Reconciled::Restart);
        assert_eq!(state.current().unwrap().id, "b");
    }

    #[test]
    fn empty_list_is_idle_and_holds() {
        let mut state = at(&["a", "b"], 1);
        assert_eq!(state.replace(list(&[])), Reconciled::Idle);
        assert_eq!(state.index(), 0);
        assert!(state.advance().is_none());
        assert!(state.current().is_none());

        assert_eq!(state.replace(list(&["c"])), Reconciled::Restart);
        assert_eq!(state.current().unwrap().id, "c");
    }

    #[test]
    fn advance_wraps_modulo_length() {
        for len in 1..6usize {
            let ids: Vec<String> = (0..len).map(|i| i.to_string()).collect();
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            for start in 0..len {
                let mut state = at(&refs, start);
                state.advance();
                assert_eq!(state.index(), (start + 1) % len);
            }
        }
    }

    #[test]
    fn end_of_list_wraps_to_first() {
        let mut state = at(&["1", "2", "3"], 2);
        assert_eq!(state.advance().unwrap().id, "1");
        assert_eq!(state.index(), 0);
    }

    #[test]
    fn single_item_wraps_onto_itself() {
        let mut state = at(&["1"], 0);
        assert_eq!(state.advance().unwrap().id, "1");
        assert_eq!(state.index(), 0);
    }

    /// Streams never end on their own; keeps the receivers alive.
    #[derive(Clone, Default)]
    struct Holding {
        started: Arc<Mutex<Vec<String>>>,
        pending: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
    }

    impl MediaSurface for Holding {
        fn show_image(&mut self, item: &Attachment, _source: &PlaybackSource) -> ViewerResult<()> {
            self.started.lock().unwrap().push(item.id.clone());
            Ok(())
        }

        fn play_stream(
            &mut self,
            item: &Attachment,
            _kind: MediaKind,
            _source: PlaybackSource,
        ) -> ViewerResult<EndOfMedia> {
            self.started.lock().unwrap().push(item.id.clone());
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().push(tx);
            Ok(rx)
        }

        fn freeze_last_frame(&mut self) {}
        fn show_placeholder(&mut self, _item: &Attachment) {}
        fn clear(&mut self) {}
    }

    struct Offline;

    #[async_trait]
    impl MediaFetcher for Offline {
        async fn fetch_bytes(&self, url: &str) -> ViewerResult<Bytes> {
            Err(ViewerError::Transport(url.to_string()))
        }
    }

    fn snapshot(ids: &[&str], revision: u64) -> PlaylistSnapshot {
        PlaylistSnapshot {
            playlist: Arc::new(ids.iter().map(|id| Attachment::new(*id, "mp3")).collect()),
            revision,
            group_key: "lobby".into(),
            state: ConnectionState::Subscribed,
            last_error: None,
            last_update: None,
        }
    }

    #[tokio::test]
    async fn swap_pending_with_finish_wins_and_drops_the_finish() {
        let surface = Holding::default();
        let ctx = Arc::new(PlayerContext::new(
            Arc::new(MediaResolver::direct("https://x")),
            None,
            Arc::new(Offline),
            Duration::from_secs(5),
            None,
        ));
        let (updates_tx, updates) = watch::channel(snapshot(&["a", "b", "c"], 0));
        let (player, finished) =
            GroupPlayer::new(&updates.borrow(), ctx, SurfaceHandle::new(surface.clone()));
        let finished_tx = player.finished_tx.clone();
        let mut position = player.position();
        let (_shutdown_tx, shutdown) = oneshot::channel();
        tokio::spawn(player.run(updates, finished, shutdown));

        let first = position
            .wait_for(|p| p.item_id.is_some())
            .await
            .unwrap()
            .clone();
        while surface.started.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        // Both arrive before the player runs again.
        updates_tx.send_replace(snapshot(&["x", "q"], 1));
        finished_tx
            .send(Finished {
                generation: first.generation.unwrap(),
                item_id: "a".into(),
            })
            .unwrap();

        let after = position
            .wait_for(|p| p.item_id.as_deref() == Some("x"))
            .await
            .unwrap()
            .clone();
        assert_eq!(after.index, 0);

        // The stale finish must not have advanced past "x".
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(position.borrow().item_id.as_deref(), Some("x"));
        assert_eq!(*surface.started.lock().unwrap(), vec!["a".to_string(), "x".to_string()]);
    }
}
