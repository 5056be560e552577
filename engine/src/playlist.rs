use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Fallback used whenever an item has no known length.
pub const DEFAULT_DURATION_SECS: u32 = 3600;

/// One entry of the channel catalog.
///
/// `playable_ref` is handed to the media layer untouched (YouTube URL, file
/// proxy URL, direct file URL). Nothing in the engine parses it except the
/// optional ffprobe duration probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub id: String,
    pub title: String,
    #[serde(alias = "url")]
    pub playable_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
}

impl PlaylistItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, playable_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            playable_ref: playable_ref.into(),
            duration_seconds: None,
        }
    }

    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_seconds = Some(secs);
        self
    }

    /// An item is schedulable only if every identifying field is non-blank.
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty() && !self.title.trim().is_empty() && !self.playable_ref.trim().is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlaylistError {
    #[error("item not found in playlist: {0}")]
    UnknownItem(String),

    #[error("duration must be a positive number of seconds")]
    InvalidDuration,
}

/// The ordered catalog. Insertion order is playback order.
///
/// Duration overrides live next to the items (not inside them) so that a
/// catalog refresh, which rebuilds every item from upstream, keeps the lengths
/// an operator or the probe already determined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    items: Vec<PlaylistItem>,
    #[serde(default)]
    duration_overrides: BTreeMap<String, u32>,
}

impl Playlist {
    pub fn new(items: Vec<PlaylistItem>) -> Self {
        let mut p = Playlist::default();
        p.replace_items(items);
        p
    }

    pub fn items(&self) -> &[PlaylistItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlaylistItem> {
        self.items.get(index)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|it| it.id == id)
    }

    pub fn duration_overrides(&self) -> &BTreeMap<String, u32> {
        &self.duration_overrides
    }

    /// Replace every item, keeping duration overrides.
    ///
    /// Invalid entries are dropped. When an id occurs more than once the last
    /// occurrence wins and keeps its own position.
    pub fn replace_items(&mut self, items: Vec<PlaylistItem>) {
        let mut out: Vec<PlaylistItem> = Vec::with_capacity(items.len());
        for item in items.into_iter().filter(PlaylistItem::is_valid) {
            out.retain(|existing| existing.id != item.id);
            out.push(item);
        }
        self.items = out;
    }

    /// Append an item at the end. An existing item with the same id is
    /// removed first. Returns false if the item was invalid.
    pub fn append(&mut self, item: PlaylistItem) -> bool {
        if !item.is_valid() {
            return false;
        }
        self.items.retain(|existing| existing.id != item.id);
        self.items.push(item);
        true
    }

    /// Remove by id, returning where it was.
    pub fn remove(&mut self, id: &str) -> Option<(usize, PlaylistItem)> {
        let idx = self.position_of(id)?;
        Some((idx, self.items.remove(idx)))
    }

    pub fn set_duration(&mut self, id: &str, secs: u32) -> Result<(), PlaylistError> {
        if secs == 0 {
            return Err(PlaylistError::InvalidDuration);
        }
        if self.position_of(id).is_none() {
            return Err(PlaylistError::UnknownItem(id.to_string()));
        }
        self.duration_overrides.insert(id.to_string(), secs);
        Ok(())
    }

    /// Record a probed length without requiring the item to be present yet.
    pub fn record_duration(&mut self, id: &str, secs: u32) {
        if secs > 0 {
            self.duration_overrides.insert(id.to_string(), secs);
        }
    }

    /// True if neither an override nor the upstream item carries a length.
    pub fn lacks_duration(&self, index: usize) -> bool {
        match self.items.get(index) {
            Some(item) => {
                !self.duration_overrides.contains_key(&item.id)
                    && item.duration_seconds.filter(|d| *d > 0).is_none()
            }
            None => false,
        }
    }

    /// Override, then upstream duration, then `default_secs`. Never zero.
    pub fn effective_duration(&self, index: usize, default_secs: u32) -> u32 {
        let fallback = default_secs.max(1);
        let Some(item) = self.items.get(index) else {
            return fallback;
        };
        self.duration_overrides
            .get(&item.id)
            .copied()
            .filter(|d| *d > 0)
            .or(item.duration_seconds.filter(|d| *d > 0))
            .unwrap_or(fallback)
    }

    pub fn total_duration(&self, default_secs: u32) -> u64 {
        (0..self.items.len())
            .map(|i| self.effective_duration(i, default_secs) as u64)
            .sum()
    }
}
