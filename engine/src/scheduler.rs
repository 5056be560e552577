// --- Scheduler ---------------------------------------------------------------
//
// Pure arithmetic: "what is on air at `now`" given the catalog and the last
// persisted reference point. No clocks are read here; callers pass `now` in
// epoch milliseconds so the same inputs always give the same answer.

use serde::{Deserialize, Serialize};

use crate::playlist::{Playlist, PlaylistItem, DEFAULT_DURATION_SECS};

/// The shared record every instance reads and writes as one value.
///
/// `offset_at_reference` seconds into `current_item_id` were reached at
/// `reference_timestamp` (epoch ms). Everything else is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackReferenceState {
    pub current_item_id: String,
    pub current_index: usize,
    pub offset_at_reference: f64,
    pub reference_timestamp: i64,
    pub is_playing: bool,
    pub total_item_count: usize,
}

impl PlaybackReferenceState {
    /// Item 0, offset 0, playing from `now_ms`.
    pub fn initial(playlist: &Playlist, now_ms: i64) -> Self {
        Self::at(playlist, 0, 0, now_ms, true)
    }

    pub fn at(playlist: &Playlist, index: usize, offset_ms: u64, now_ms: i64, is_playing: bool) -> Self {
        let current_item_id = playlist
            .get(index)
            .map(|it| it.id.clone())
            .unwrap_or_default();
        Self {
            current_item_id,
            current_index: index,
            offset_at_reference: offset_ms as f64 / 1000.0,
            reference_timestamp: now_ms,
            is_playing,
            total_item_count: playlist.len(),
        }
    }

    /// Offset in whole milliseconds. Garbage (negative, NaN) reads as zero.
    pub fn offset_ms(&self) -> u64 {
        let ms = self.offset_at_reference * 1000.0;
        if ms.is_finite() && ms > 0.0 {
            ms.round() as u64
        } else {
            0
        }
    }
}

/// Result of one scheduling computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackState {
    pub current_index: usize,
    pub current_item: Option<PlaylistItem>,
    pub next_item: Option<PlaylistItem>,
    pub offset_within_item_ms: u64,
    /// Whole seconds, always `< item_duration_secs`.
    pub offset_within_item: u64,
    pub remaining_seconds_in_item: u64,
    pub item_duration_secs: u32,
    pub total_duration_secs: u64,
    pub is_playing: bool,
}

impl PlaybackState {
    /// "No content" sentinel for an empty catalog.
    pub fn no_content() -> Self {
        Self {
            current_index: 0,
            current_item: None,
            next_item: None,
            offset_within_item_ms: 0,
            offset_within_item: 0,
            remaining_seconds_in_item: 0,
            item_duration_secs: 0,
            total_duration_secs: 0,
            is_playing: false,
        }
    }

    pub fn has_content(&self) -> bool {
        self.current_item.is_some()
    }

    pub fn current_item_id(&self) -> Option<&str> {
        self.current_item.as_ref().map(|it| it.id.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    default_duration_secs: u32,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DURATION_SECS)
    }
}

impl Scheduler {
    pub fn new(default_duration_secs: u32) -> Self {
        Self {
            default_duration_secs: default_duration_secs.max(1),
        }
    }

    pub fn default_duration_secs(&self) -> u32 {
        self.default_duration_secs
    }

    /// Where the reference item sits in the current ordering.
    ///
    /// `current_index` is only a hint: the catalog may have been edited since
    /// the reference was written, so the id is authoritative. If the id is
    /// gone, whatever now occupies the slot is used.
    pub fn resolve_reference_index(playlist: &Playlist, reference: &PlaybackReferenceState) -> usize {
        let n = playlist.len();
        if n == 0 {
            return 0;
        }
        match playlist.get(reference.current_index) {
            Some(it) if it.id == reference.current_item_id => reference.current_index,
            _ => playlist
                .position_of(&reference.current_item_id)
                .unwrap_or(reference.current_index % n),
        }
    }

    pub fn compute_state(&self, playlist: &Playlist, reference: &PlaybackReferenceState, now_ms: i64) -> PlaybackState {
        if playlist.is_empty() {
            return PlaybackState::no_content();
        }

        let n = playlist.len();
        let durations_ms: Vec<u64> = (0..n)
            .map(|i| playlist.effective_duration(i, self.default_duration_secs) as u64 * 1000)
            .collect();
        let total_ms: u64 = durations_ms.iter().sum();

        // Clock skew: a reference stamped "in the future" counts as zero elapsed.
        let elapsed_ms = if reference.is_playing {
            now_ms.saturating_sub(reference.reference_timestamp).max(0) as u64
        } else {
            0
        };

        let start = Self::resolve_reference_index(playlist, reference);

        // Position measured from the start of the reference item. One full
        // cycle from there is exactly `total_ms`, so reduce before walking.
        let mut pos = reference.offset_ms().saturating_add(elapsed_ms) % total_ms;
        let mut idx = start;
        while pos >= durations_ms[idx] {
            pos -= durations_ms[idx];
            idx = (idx + 1) % n;
        }

        let item_duration_secs = (durations_ms[idx] / 1000) as u32;
        let offset_secs = pos / 1000;

        PlaybackState {
            current_index: idx,
            current_item: playlist.get(idx).cloned(),
            next_item: playlist.get((idx + 1) % n).cloned(),
            offset_within_item_ms: pos,
            offset_within_item: offset_secs,
            remaining_seconds_in_item: item_duration_secs as u64 - offset_secs,
            item_duration_secs,
            total_duration_secs: total_ms / 1000,
            is_playing: reference.is_playing,
        }
    }
}
