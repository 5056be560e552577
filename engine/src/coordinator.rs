// --- Sync coordinator ----------------------------------------------------------
//
// Glue between the pure scheduler and the shared store. Every instance is
// stateless in the sense that the store is the source of truth: each request
// re-reads the catalog and the reference state, computes what is on air, and
// writes back only when an item boundary was crossed ("lazy advance").
//
// Nothing here ticks. There is no background task; advancement happens on
// the read that notices it.
//
// Degraded mode: if the store is unconfigured, slow or failing, the
// coordinator keeps going on a process-local mirror of the last values it
// saw or wrote. Viewers never see an error for this; operators see it in the
// logs and on /api/v1/ping.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RefreshPolicy;
use crate::content::{events_to_items, ContentSource};
use crate::playlist::{Playlist, PlaylistError, PlaylistItem};
use crate::probe::probe_duration_seconds;
use crate::scheduler::{PlaybackReferenceState, PlaybackState, Scheduler};
use crate::store::{SharedStateStore, PLAYLIST_KEY, STATE_KEY};

const PROBE_CONCURRENCY: usize = 4;
const PROBE_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    #[error("item needs a non-empty id, title and playable reference")]
    InvalidItem,

    #[error("offset must be a non-negative number of seconds")]
    InvalidOffset,

    #[error("content source failed: {0}")]
    ContentSource(anyhow::Error),
}

/// Everything a read endpoint needs, computed at one instant.
#[derive(Debug, Clone)]
pub struct ChannelView {
    pub state: PlaybackState,
    pub playlist: Playlist,
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub backend: &'static str,
    pub shared: bool,
    pub degraded: bool,
}

pub struct CoordinatorOptions {
    pub scheduler: Scheduler,
    pub ttl: Duration,
    pub store_timeout: Duration,
    pub refresh_policy: RefreshPolicy,
    /// ffprobe binary; `None` disables probing on refresh.
    pub ffprobe: Option<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            scheduler: Scheduler::default(),
            ttl: Duration::from_secs(86_400),
            store_timeout: Duration::from_millis(1_500),
            refresh_policy: RefreshPolicy::Reset,
            ffprobe: None,
        }
    }
}

/// Last values seen or written; what we serve when the store is unavailable.
#[derive(Default)]
struct LocalMirror {
    playlist: Option<Playlist>,
    state: Option<PlaybackReferenceState>,
}

pub struct SyncCoordinator {
    opts: CoordinatorOptions,
    store: Option<Arc<dyn SharedStateStore>>,
    source: Arc<dyn ContentSource>,
    local: tokio::sync::RwLock<LocalMirror>,
    degraded: AtomicBool,
    last_touch_ms: AtomicI64,
    /// Playable refs ffprobe already failed on.
    unprobeable: tokio::sync::Mutex<HashSet<String>>,
}

impl SyncCoordinator {
    pub fn new(
        store: Option<Arc<dyn SharedStateStore>>,
        source: Arc<dyn ContentSource>,
        opts: CoordinatorOptions,
    ) -> Self {
        if store.is_none() {
            warn!("no shared store configured; playback state is local to this instance");
        }
        Self {
            degraded: AtomicBool::new(store.is_none()),
            opts,
            store,
            source,
            local: tokio::sync::RwLock::new(LocalMirror::default()),
            last_touch_ms: AtomicI64::new(0),
            unprobeable: tokio::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.opts.scheduler
    }

    pub fn store_status(&self) -> StoreStatus {
        StoreStatus {
            backend: self.store.as_ref().map(|s| s.backend()).unwrap_or("none"),
            shared: self.store.is_some(),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    // --- Reads -----------------------------------------------------------------

    /// What is on air at `now_ms`. Never fails: storage trouble degrades to
    /// local memory, corrupt or expired state restarts at item 0.
    pub async fn current(&self, now_ms: i64) -> ChannelView {
        let (playlist, reference) = self.snapshot(now_ms).await;

        let state = self.opts.scheduler.compute_state(&playlist, &reference, now_ms);

        if state.has_content() && needs_advance(&state, &reference, playlist.len()) {
            let next = rebase(&playlist, &state, now_ms);
            debug!(
                from = reference.current_index,
                to = state.current_index,
                item = %next.current_item_id,
                "lazy advance"
            );
            self.save_state(&next).await;
        } else {
            self.maybe_touch(now_ms).await;
        }

        ChannelView {
            state,
            playlist,
            server_time_ms: now_ms,
        }
    }

    /// Load catalog + reference, initializing whatever is missing.
    ///
    /// An empty catalog counts as missing: the content source is asked again
    /// on every read until it has something playable, and nothing is saved
    /// until then.
    async fn snapshot(&self, now_ms: i64) -> (Playlist, PlaybackReferenceState) {
        let (loaded, reference) = self.load().await;

        let playlist = match loaded {
            Some(p) if !p.is_empty() => p,
            other => {
                let mut playlist = other.unwrap_or_default();
                match self.pull_catalog().await {
                    Ok(items) => playlist.replace_items(items),
                    Err(e) => warn!("catalog unavailable, serving no content: {e}"),
                }
                if playlist.is_empty() {
                    debug!("content source has nothing playable yet");
                    return (playlist, PlaybackReferenceState::initial(&Playlist::default(), now_ms));
                }
                // First population (or the snapshot expired): start fresh.
                let reference = PlaybackReferenceState::initial(&playlist, now_ms);
                info!(items = playlist.len(), "catalog initialized from {}", self.source.describe());
                self.save_playlist(&playlist).await;
                self.save_state(&reference).await;
                return (playlist, reference);
            }
        };

        let reference = match reference {
            Some(r) => r,
            None => {
                let r = PlaybackReferenceState::initial(&playlist, now_ms);
                info!("no playback reference found; starting at item 0");
                self.save_state(&r).await;
                r
            }
        };

        (playlist, reference)
    }

    // --- Administrative mutations ------------------------------------------------

    /// Re-pull the catalog from the content source. Returns the new size.
    pub async fn refresh(&self, now_ms: i64) -> Result<usize, CoordinatorError> {
        let items = self.pull_catalog().await.map_err(CoordinatorError::ContentSource)?;
        let n = self.replace_catalog(items, now_ms).await;
        info!(items = n, "catalog refreshed from {}", self.source.describe());
        Ok(n)
    }

    /// Replace the catalog with caller-supplied items. Returns the new size.
    pub async fn set_playlist(&self, items: Vec<PlaylistItem>, now_ms: i64) -> usize {
        let n = self.replace_catalog(items, now_ms).await;
        info!(items = n, "catalog replaced");
        n
    }

    async fn replace_catalog(&self, items: Vec<PlaylistItem>, now_ms: i64) -> usize {
        // The new items replace whatever is stored, so a cold store is not
        // initialized from the content source first.
        let (loaded, reference) = self.load().await;
        let mut playlist = loaded.unwrap_or_default();
        let on_air = reference
            .as_ref()
            .map(|r| (self.opts.scheduler.compute_state(&playlist, r, now_ms), r.is_playing));

        playlist.replace_items(items);
        self.probe_missing_durations(&mut playlist).await;

        let preserved = match (self.opts.refresh_policy, on_air) {
            (RefreshPolicy::Preserve, Some((st, is_playing))) => st
                .current_item_id()
                .and_then(|id| playlist.position_of(id))
                .map(|idx| PlaybackReferenceState::at(&playlist, idx, st.offset_within_item_ms, now_ms, is_playing)),
            _ => None,
        };
        let next = preserved.unwrap_or_else(|| PlaybackReferenceState::initial(&playlist, now_ms));

        self.save_playlist(&playlist).await;
        self.save_state(&next).await;
        playlist.len()
    }

    pub async fn add(&self, item: PlaylistItem, now_ms: i64) -> Result<usize, CoordinatorError> {
        let title = item.title.clone();
        let n = self
            .edit(now_ms, move |playlist, _| {
                if playlist.append(item) {
                    Ok(())
                } else {
                    Err(CoordinatorError::InvalidItem)
                }
            })
            .await?;
        info!(items = n, "added to catalog: {title}");
        Ok(n)
    }

    /// Remove by id. Removing an absent id is a no-op so retries are safe.
    pub async fn remove(&self, id: &str, now_ms: i64) -> Result<usize, CoordinatorError> {
        let target = id.to_string();
        let n = self
            .edit(now_ms, move |playlist, on_air| {
                if let Some((idx, _)) = playlist.remove(&target) {
                    // The removed item was on air: the next one starts now.
                    if on_air.current_item_id.as_deref() == Some(target.as_str()) {
                        on_air.current_item_id = None;
                        on_air.fallback_index = idx;
                        on_air.offset_ms = 0;
                    }
                }
                Ok(())
            })
            .await?;
        info!(items = n, "removed from catalog: {id}");
        Ok(n)
    }

    pub async fn set_duration(&self, id: &str, secs: u32, now_ms: i64) -> Result<(), CoordinatorError> {
        let target = id.to_string();
        self.edit(now_ms, move |playlist, _| Ok(playlist.set_duration(&target, secs)?))
            .await?;
        info!("duration for {id} set to {secs}s");
        Ok(())
    }

    /// Put `item_id` on air at `offset_secs`, effective immediately for everyone.
    pub async fn force_sync(&self, item_id: &str, offset_secs: f64, now_ms: i64) -> Result<PlaybackState, CoordinatorError> {
        if !offset_secs.is_finite() || offset_secs < 0.0 {
            return Err(CoordinatorError::InvalidOffset);
        }
        let (playlist, reference) = self.snapshot(now_ms).await;
        let idx = playlist
            .position_of(item_id)
            .ok_or_else(|| PlaylistError::UnknownItem(item_id.to_string()))?;

        let offset_ms = (offset_secs * 1000.0).round() as u64;
        let next = PlaybackReferenceState::at(&playlist, idx, offset_ms, now_ms, reference.is_playing);
        self.save_state(&next).await;
        info!("force-sync: {item_id} at {offset_secs:.1}s");
        Ok(self.opts.scheduler.compute_state(&playlist, &next, now_ms))
    }

    /// Freeze the current position.
    pub async fn pause(&self, now_ms: i64) -> PlaybackState {
        self.set_playing(false, now_ms).await
    }

    /// Resume from the frozen position with a fresh reference timestamp.
    pub async fn play(&self, now_ms: i64) -> PlaybackState {
        self.set_playing(true, now_ms).await
    }

    async fn set_playing(&self, playing: bool, now_ms: i64) -> PlaybackState {
        let (playlist, reference) = self.snapshot(now_ms).await;
        let on_air = self.opts.scheduler.compute_state(&playlist, &reference, now_ms);
        if playlist.is_empty() || reference.is_playing == playing {
            return on_air;
        }
        let next = PlaybackReferenceState::at(&playlist, on_air.current_index, on_air.offset_within_item_ms, now_ms, playing);
        self.save_state(&next).await;
        info!(item = %next.current_item_id, offset = next.offset_at_reference, "{}", if playing { "play" } else { "pause" });
        self.opts.scheduler.compute_state(&playlist, &next, now_ms)
    }

    /// Read-modify-write of the catalog that keeps whatever is on air at
    /// `now_ms` where it is, even if earlier items change length or move.
    async fn edit<F>(&self, now_ms: i64, f: F) -> Result<usize, CoordinatorError>
    where
        F: FnOnce(&mut Playlist, &mut OnAir) -> Result<(), CoordinatorError>,
    {
        let (mut playlist, reference) = self.snapshot(now_ms).await;
        let st = self.opts.scheduler.compute_state(&playlist, &reference, now_ms);
        let mut on_air = OnAir {
            current_item_id: st.current_item_id().map(str::to_string),
            fallback_index: st.current_index,
            offset_ms: st.offset_within_item_ms,
        };

        f(&mut playlist, &mut on_air)?;

        let idx = on_air
            .current_item_id
            .as_deref()
            .and_then(|id| playlist.position_of(id))
            .unwrap_or(if on_air.fallback_index < playlist.len() { on_air.fallback_index } else { 0 });
        let was_empty = st.current_item.is_none();
        let next = if was_empty {
            PlaybackReferenceState::initial(&playlist, now_ms)
        } else {
            PlaybackReferenceState::at(&playlist, idx, on_air.offset_ms, now_ms, reference.is_playing)
        };

        self.save_playlist(&playlist).await;
        self.save_state(&next).await;
        Ok(playlist.len())
    }

    async fn pull_catalog(&self) -> anyhow::Result<Vec<PlaylistItem>> {
        let events = self.source.list_playable_events().await?;
        Ok(events_to_items(events))
    }

    /// Fill in lengths for items that have none, a few probes at a time and
    /// within `PROBE_BUDGET` overall. Inputs ffprobe could not read are not
    /// retried by this process.
    async fn probe_missing_durations(&self, playlist: &mut Playlist) {
        let Some(ffprobe) = self.opts.ffprobe.clone() else {
            return;
        };
        let missing: Vec<(String, String)> = {
            let unprobeable = self.unprobeable.lock().await;
            (0..playlist.len())
                .filter(|i| playlist.lacks_duration(*i))
                .filter_map(|i| playlist.get(i).map(|it| (it.id.clone(), it.playable_ref.clone())))
                .filter(|(_, input)| !unprobeable.contains(input))
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        let total = missing.len();
        let deadline = tokio::time::Instant::now() + PROBE_BUDGET;
        let mut queue = missing.into_iter();
        let mut tasks = JoinSet::new();
        let mut probed = 0usize;
        let mut failed = Vec::new();

        loop {
            while tasks.len() < PROBE_CONCURRENCY {
                let Some((id, input)) = queue.next() else {
                    break;
                };
                let ffprobe = ffprobe.clone();
                tasks.spawn(async move {
                    let secs = probe_duration_seconds(&ffprobe, &input).await;
                    (id, input, secs)
                });
            }
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, _, Some(secs))))) => {
                    playlist.record_duration(&id, secs);
                    probed += 1;
                }
                Ok(Some(Ok((_, input, None)))) => failed.push(input),
                Ok(Some(Err(e))) => debug!("probe task failed: {e}"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "duration probing stopped after {}s; {} items keep the default",
                        PROBE_BUDGET.as_secs(),
                        tasks.len() + queue.len()
                    );
                    break;
                }
            }
        }

        info!("probed {probed}/{total} items without a known duration");
        self.unprobeable.lock().await.extend(failed);
    }

    // --- Persistence -------------------------------------------------------------

    async fn load(&self) -> (Option<Playlist>, Option<PlaybackReferenceState>) {
        let Some(store) = self.store.as_ref() else {
            let local = self.local.read().await;
            return (local.playlist.clone(), local.state.clone());
        };

        let timeout = self.opts.store_timeout;
        let (p, s) = tokio::join!(
            tokio::time::timeout(timeout, store.get(PLAYLIST_KEY)),
            tokio::time::timeout(timeout, store.get(STATE_KEY)),
        );

        match (flatten(p), flatten(s)) {
            (Ok(p_raw), Ok(s_raw)) => {
                self.mark_healthy();
                let playlist = p_raw.and_then(|raw| decode::<Playlist>(PLAYLIST_KEY, &raw));
                let state = s_raw.and_then(|raw| decode::<PlaybackReferenceState>(STATE_KEY, &raw));
                let mut local = self.local.write().await;
                local.playlist = playlist.clone();
                local.state = state.clone();
                (playlist, state)
            }
            (Err(e), _) | (_, Err(e)) => {
                self.mark_degraded(&e);
                let local = self.local.read().await;
                (local.playlist.clone(), local.state.clone())
            }
        }
    }

    async fn save_playlist(&self, playlist: &Playlist) {
        self.local.write().await.playlist = Some(playlist.clone());
        self.persist(PLAYLIST_KEY, playlist).await;
    }

    async fn save_state(&self, state: &PlaybackReferenceState) {
        self.local.write().await.state = Some(state.clone());
        self.persist(STATE_KEY, state).await;
    }

    async fn persist<T: Serialize>(&self, key: &str, value: &T) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("failed to encode {key}: {e}");
                return;
            }
        };
        let res = tokio::time::timeout(self.opts.store_timeout, store.set(key, &raw, self.opts.ttl)).await;
        match flatten(res) {
            Ok(()) => self.mark_healthy(),
            Err(e) => self.mark_degraded(&e),
        }
    }

    /// Keep an actively-read channel from expiring when nothing is written.
    async fn maybe_touch(&self, now_ms: i64) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let every_ms = (self.opts.ttl.as_millis() / 4) as i64;
        let last = self.last_touch_ms.load(Ordering::Relaxed);
        if now_ms - last < every_ms {
            return;
        }
        if self
            .last_touch_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        for key in [PLAYLIST_KEY, STATE_KEY] {
            let res = tokio::time::timeout(self.opts.store_timeout, store.touch(key, self.opts.ttl)).await;
            if let Err(e) = flatten(res) {
                debug!("failed to refresh expiry of {key}: {e}");
            }
        }
    }

    fn mark_degraded(&self, e: &anyhow::Error) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!("shared store unavailable, serving process-local state: {e}");
        } else {
            debug!("shared store still unavailable: {e}");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("shared store reachable again");
        }
    }
}

/// What was on air when an edit started.
struct OnAir {
    current_item_id: Option<String>,
    fallback_index: usize,
    offset_ms: u64,
}

fn needs_advance(state: &PlaybackState, reference: &PlaybackReferenceState, len: usize) -> bool {
    state.current_index != reference.current_index
        || state.current_item_id() != Some(reference.current_item_id.as_str())
        || reference.total_item_count != len
}

/// New reference anchored on the item that is on air now.
///
/// While playing, the reference is moved back to the instant the item started
/// (offset 0), so the stored timestamp marks the real boundary and not the
/// moment some reader happened to notice it.
fn rebase(playlist: &Playlist, state: &PlaybackState, now_ms: i64) -> PlaybackReferenceState {
    if state.is_playing {
        let started_at = now_ms - state.offset_within_item_ms as i64;
        PlaybackReferenceState::at(playlist, state.current_index, 0, started_at, true)
    } else {
        PlaybackReferenceState::at(playlist, state.current_index, state.offset_within_item_ms, now_ms, false)
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("stored {key} is unreadable, reinitializing: {e}");
            None
        }
    }
}

fn flatten<T>(res: Result<anyhow::Result<T>, tokio::time::error::Elapsed>) -> anyhow::Result<T> {
    match res {
        Ok(inner) => inner,
        Err(_) => Err(anyhow::anyhow!("store call timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{NoContentSource, PlayableEvent};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    const T0: i64 = 1_700_000_000_000;

    struct FixedSource(Vec<PlayableEvent>);

    #[async_trait]
    impl ContentSource for FixedSource {
        fn describe(&self) -> String {
            "fixed".into()
        }

        async fn list_playable_events(&self) -> anyhow::Result<Vec<PlayableEvent>> {
            Ok(self.0.clone())
        }
    }

    /// Content whose upstream list can change between pulls.
    #[derive(Default)]
    struct SwitchSource {
        events: std::sync::Mutex<Vec<PlayableEvent>>,
        pulls: std::sync::atomic::AtomicUsize,
    }

    impl SwitchSource {
        fn with(events: Vec<PlayableEvent>) -> Self {
            let s = Self::default();
            s.set(events);
            s
        }

        fn set(&self, events: Vec<PlayableEvent>) {
            *self.events.lock().unwrap() = events;
        }

        fn pulls(&self) -> usize {
            self.pulls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentSource for SwitchSource {
        fn describe(&self) -> String {
            "switch".into()
        }

        async fn list_playable_events(&self) -> anyhow::Result<Vec<PlayableEvent>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(self.events.lock().unwrap().clone())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SharedStateStore for BrokenStore {
        fn backend(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("connection refused")
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn touch(&self, _: &str, _: Duration) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    struct SlowStore;

    #[async_trait]
    impl SharedStateStore for SlowStore {
        fn backend(&self) -> &'static str {
            "slow"
        }
        async fn get(&self, _: &str) -> anyhow::Result<Option<String>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
        async fn touch(&self, _: &str, _: Duration) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn event(id: &str, minutes: f64) -> PlayableEvent {
        PlayableEvent {
            id: id.into(),
            title: format!("Event {id}"),
            playable_ref: Some(format!("https://media.example/{id}.mp4")),
            duration_minutes: Some(minutes),
        }
    }

    fn item(id: &str, secs: u32) -> PlaylistItem {
        PlaylistItem::new(id, format!("Item {id}"), format!("https://media.example/{id}.mp4")).with_duration(secs)
    }

    fn coordinator_with(store: Arc<dyn SharedStateStore>, events: Vec<PlayableEvent>) -> SyncCoordinator {
        SyncCoordinator::new(Some(store), Arc::new(FixedSource(events)), CoordinatorOptions::default())
    }

    async fn stored_reference(store: &MemoryStore) -> PlaybackReferenceState {
        let raw = store.get(STATE_KEY).await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn first_read_initializes_from_content_source() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store.clone(), vec![event("a", 2.0), event("b", 3.0)]);

        let view = c.current(T0).await;
        assert_eq!(view.state.current_item_id(), Some("a"));
        assert_eq!(view.state.offset_within_item, 0);
        assert_eq!(view.playlist.len(), 2);

        let r = stored_reference(&store).await;
        assert_eq!((r.current_index, r.reference_timestamp, r.total_item_count), (0, T0, 2));
    }

    #[tokio::test]
    async fn lazy_advance_persists_boundary_crossing() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store.clone(), vec![event("a", 2.0), event("b", 3.0)]);
        c.current(T0).await;

        // 130 s in: "a" (120 s) is over, "b" has been on for 10 s.
        let view = c.current(T0 + 130_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("b"), 10));

        let r = stored_reference(&store).await;
        assert_eq!(r.current_item_id, "b");
        assert_eq!(r.current_index, 1);
        assert_eq!(r.reference_timestamp, T0 + 120_000);
        assert_eq!(r.offset_at_reference, 0.0);
    }

    #[tokio::test]
    async fn instances_sharing_a_store_agree() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let a = coordinator_with(store.clone(), vec![event("a", 2.0), event("b", 3.0)]);
        let b = coordinator_with(store.clone(), vec![event("a", 2.0), event("b", 3.0)]);

        a.current(T0).await;
        let va = a.current(T0 + 200_000).await;
        let vb = b.current(T0 + 200_000).await;
        assert_eq!(va.state, vb.state);
        assert_eq!((vb.state.current_item_id(), vb.state.offset_within_item), (Some("b"), 80));

        // Both write the same advance; reading again changes nothing.
        let again = b.current(T0 + 200_000).await;
        assert_eq!(again.state, va.state);
    }

    #[tokio::test]
    async fn corrupt_state_reinitializes_at_zero() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store.clone(), vec![event("a", 2.0), event("b", 3.0)]);
        c.current(T0).await;

        store.set(STATE_KEY, "{not json", Duration::from_secs(60)).await.unwrap();
        let view = c.current(T0 + 500_000).await;
        assert_eq!((view.state.current_index, view.state.offset_within_item), (0, 0));
        assert_eq!(stored_reference(&store).await.reference_timestamp, T0 + 500_000);
    }

    #[tokio::test]
    async fn unreachable_store_degrades_to_local_memory() {
        let c = coordinator_with(Arc::new(BrokenStore), vec![event("a", 2.0), event("b", 3.0)]);

        let view = c.current(T0).await;
        assert_eq!(view.state.current_item_id(), Some("a"));
        assert!(c.store_status().degraded);

        // Local mirror keeps the reference, so time still moves forward.
        let view = c.current(T0 + 125_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("b"), 5));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_instead_of_blocking() {
        let opts = CoordinatorOptions {
            store_timeout: Duration::from_millis(100),
            ..CoordinatorOptions::default()
        };
        let c = SyncCoordinator::new(Some(Arc::new(SlowStore)), Arc::new(FixedSource(vec![event("a", 1.0)])), opts);
        let view = c.current(T0).await;
        assert_eq!(view.state.current_item_id(), Some("a"));
        assert!(c.store_status().degraded);
    }

    #[tokio::test]
    async fn no_store_is_reported_as_degraded() {
        let c = SyncCoordinator::new(None, Arc::new(NoContentSource), CoordinatorOptions::default());
        let status = c.store_status();
        assert_eq!((status.backend, status.shared, status.degraded), ("none", false, true));

        let view = c.current(T0).await;
        assert!(!view.state.has_content());
        assert!(!view.state.is_playing);
    }

    #[tokio::test]
    async fn refresh_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store.clone(), vec![event("a", 2.0), event("b", 3.0)]);
        c.current(T0).await;

        assert_eq!(c.refresh(T0 + 90_000).await.unwrap(), 2);
        let first = c.current(T0 + 90_000).await;
        assert_eq!(c.refresh(T0 + 90_000).await.unwrap(), 2);
        let second = c.current(T0 + 90_000).await;

        assert_eq!(first.playlist, second.playlist);
        assert_eq!(first.state, second.state);
        assert_eq!((second.state.current_index, second.state.offset_within_item), (0, 0));
    }

    #[tokio::test]
    async fn preserve_policy_keeps_current_item() {
        let store = Arc::new(MemoryStore::new());
        let opts = CoordinatorOptions {
            refresh_policy: RefreshPolicy::Preserve,
            ..CoordinatorOptions::default()
        };
        let c = SyncCoordinator::new(Some(store), Arc::new(FixedSource(vec![])), opts);
        c.set_playlist(vec![item("a", 100), item("b", 200)], T0).await;

        // 150 s in: "b" at 50 s. New catalog puts "b" first.
        c.set_playlist(vec![item("b", 200), item("c", 60)], T0 + 150_000).await;
        let view = c.current(T0 + 150_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("b"), 50));
    }

    #[tokio::test]
    async fn set_duration_keeps_position_and_shortens_item() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store, vec![]);
        c.set_playlist(vec![item("a", 3600), item("b", 100)], T0).await;

        c.set_duration("a", 60, T0 + 30_000).await.unwrap();
        let view = c.current(T0 + 30_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("a"), 30));

        let view = c.current(T0 + 70_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("b"), 10));

        assert!(matches!(
            c.set_duration("zzz", 60, T0).await,
            Err(CoordinatorError::Playlist(PlaylistError::UnknownItem(_)))
        ));
    }

    #[tokio::test]
    async fn remove_on_air_item_starts_the_next_one() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store, vec![]);
        c.set_playlist(vec![item("a", 100), item("b", 100), item("c", 100)], T0).await;

        assert_eq!(c.remove("b", T0 + 150_000).await.unwrap(), 2);
        let view = c.current(T0 + 150_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("c"), 0));

        // Removing something that is not there changes nothing.
        assert_eq!(c.remove("b", T0 + 151_000).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn add_appends_without_moving_playback() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store, vec![]);
        c.set_playlist(vec![item("a", 100)], T0).await;

        assert_eq!(c.add(item("b", 50), T0 + 40_000).await.unwrap(), 2);
        let view = c.current(T0 + 40_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("a"), 40));
        assert_eq!(view.state.next_item.as_ref().map(|i| i.id.as_str()), Some("b"));

        let blank = PlaylistItem::new("c", " ", "ref");
        assert!(matches!(c.add(blank, T0 + 41_000).await, Err(CoordinatorError::InvalidItem)));
    }

    #[tokio::test]
    async fn force_sync_and_pause_play() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator_with(store, vec![]);
        c.set_playlist(vec![item("a", 100), item("b", 200)], T0).await;

        let st = c.force_sync("b", 42.0, T0 + 1_000).await.unwrap();
        assert_eq!((st.current_item_id(), st.offset_within_item), (Some("b"), 42));
        assert!(matches!(c.force_sync("b", -1.0, T0).await, Err(CoordinatorError::InvalidOffset)));
        assert!(c.force_sync("nope", 0.0, T0).await.is_err());

        let paused = c.pause(T0 + 11_000).await;
        assert_eq!(paused.offset_within_item, 52);
        assert!(!paused.is_playing);
        let later = c.current(T0 + 600_000).await;
        assert_eq!((later.state.offset_within_item, later.state.is_playing), (52, false));

        c.play(T0 + 600_000).await;
        let resumed = c.current(T0 + 605_000).await;
        assert_eq!((resumed.state.current_item_id(), resumed.state.offset_within_item), (Some("b"), 57));
        assert!(resumed.state.is_playing);
    }

    #[tokio::test]
    async fn expired_playlist_is_pulled_again() {
        let store = Arc::new(MemoryStore::new());
        let opts = CoordinatorOptions {
            ttl: Duration::from_millis(30),
            ..CoordinatorOptions::default()
        };
        let c = SyncCoordinator::new(Some(store), Arc::new(FixedSource(vec![event("a", 1.0)])), opts);
        c.set_playlist(vec![item("x", 100), item("y", 100)], T0).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let view = c.current(T0 + 150_000).await;
        assert_eq!(view.playlist.len(), 1);
        assert_eq!(view.state.current_item_id(), Some("a"));
    }

    #[tokio::test]
    async fn empty_catalog_is_pulled_again_until_content_appears() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(SwitchSource::default());
        let c = SyncCoordinator::new(Some(store.clone()), source.clone(), CoordinatorOptions::default());

        let view = c.current(T0).await;
        assert!(!view.state.has_content());
        assert!(store.get(PLAYLIST_KEY).await.unwrap().is_none());
        c.current(T0 + 60_000).await;
        assert_eq!(source.pulls(), 2);

        source.set(vec![event("a", 2.0)]);
        let view = c.current(T0 + 120_000).await;
        assert_eq!((view.state.current_item_id(), view.state.offset_within_item), (Some("a"), 0));
        assert_eq!(stored_reference(&store).await.reference_timestamp, T0 + 120_000);

        // Populated now: later reads come from the store.
        let view = c.current(T0 + 130_000).await;
        assert_eq!(view.state.offset_within_item, 10);
        assert_eq!(source.pulls(), 3);
    }

    #[tokio::test]
    async fn replacing_on_a_cold_store_pulls_at_most_once() {
        let source = Arc::new(SwitchSource::with(vec![event("a", 2.0), event("b", 3.0)]));
        let c = SyncCoordinator::new(Some(Arc::new(MemoryStore::new())), source.clone(), CoordinatorOptions::default());
        assert_eq!(c.refresh(T0).await.unwrap(), 2);
        assert_eq!(source.pulls(), 1);

        let view = c.current(T0 + 1_000).await;
        assert_eq!(view.state.current_item_id(), Some("a"));
        assert_eq!(source.pulls(), 1);

        let source = Arc::new(SwitchSource::with(vec![event("z", 1.0)]));
        let c = SyncCoordinator::new(Some(Arc::new(MemoryStore::new())), source.clone(), CoordinatorOptions::default());
        c.set_playlist(vec![item("x", 100)], T0).await;
        assert_eq!(source.pulls(), 0);
        assert_eq!(c.current(T0).await.state.current_item_id(), Some("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_keep_an_active_channel_from_expiring() {
        let store = Arc::new(MemoryStore::new());
        let opts = CoordinatorOptions {
            ttl: Duration::from_millis(200),
            ..CoordinatorOptions::default()
        };
        let c = SyncCoordinator::new(Some(store.clone()), Arc::new(FixedSource(vec![event("a", 60.0)])), opts);
        c.current(T0).await;

        // Three TTLs worth of reads, none crossing an item boundary.
        for step in 1..=20 {
            tokio::time::advance(Duration::from_millis(30)).await;
            c.current(T0 + step * 30).await;
        }
        assert_eq!(stored_reference(&store).await.reference_timestamp, T0);
        let view = c.current(T0 + 600).await;
        assert_eq!(view.state.offset_within_item_ms, 600);

        // Once nobody reads, the state lapses.
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(store.get(STATE_KEY).await.unwrap().is_none());
        assert!(store.get(PLAYLIST_KEY).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_durations_are_filled_and_failures_not_retried() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");
        let script = dir.path().join("fake-ffprobe");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\ncase \"$*\" in *good.mp4*) echo 90.2 ;; *) exit 1 ;; esac\n",
                calls.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let opts = CoordinatorOptions {
            ffprobe: Some(script.to_string_lossy().to_string()),
            ..CoordinatorOptions::default()
        };
        let c = SyncCoordinator::new(Some(Arc::new(MemoryStore::new())), Arc::new(FixedSource(vec![])), opts);
        let items = || {
            vec![
                PlaylistItem::new("good", "Good", "/media/good.mp4"),
                PlaylistItem::new("bad", "Bad", "https://youtu.be/xyz"),
                item("known", 100),
            ]
        };
        let calls_made = || std::fs::read_to_string(&calls).map(|s| s.lines().count()).unwrap_or(0);

        c.set_playlist(items(), T0).await;
        assert_eq!(calls_made(), 2);
        let view = c.current(T0).await;
        assert_eq!(view.playlist.effective_duration(0, 3600), 90);
        assert!(view.playlist.lacks_duration(1));

        // "good" now has a length and "bad" already failed: nothing to run.
        c.set_playlist(items(), T0 + 1_000).await;
        assert_eq!(calls_made(), 2);
    }
}
