// --- Content source ------------------------------------------------------------
//
// The catalog of record lives outside the engine (an events table maintained
// by the content team). We only need `list_playable_events()`; this module
// provides a JSON-file source for single-box installs and an HTTP source for
// anything that can serve the same JSON array.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::playlist::PlaylistItem;

/// One upstream event as the content source reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayableEvent {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "url")]
    pub playable_ref: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<f64>,
}

impl PlayableEvent {
    /// Events without a playable reference are not schedulable.
    pub fn into_item(self) -> Option<PlaylistItem> {
        let playable_ref = self.playable_ref.filter(|r| !r.trim().is_empty())?;
        let duration_seconds = self
            .duration_minutes
            .filter(|m| m.is_finite() && *m > 0.0)
            .map(|m| (m * 60.0).round() as u32)
            .filter(|s| *s > 0);
        let item = PlaylistItem {
            id: self.id,
            title: self.title,
            playable_ref,
            duration_seconds,
        };
        item.is_valid().then_some(item)
    }
}

pub fn events_to_items(events: Vec<PlayableEvent>) -> Vec<PlaylistItem> {
    events.into_iter().filter_map(PlayableEvent::into_item).collect()
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    fn describe(&self) -> String;

    async fn list_playable_events(&self) -> anyhow::Result<Vec<PlayableEvent>>;
}

pub struct FileContentSource {
    path: String,
}

impl FileContentSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ContentSource for FileContentSource {
    fn describe(&self) -> String {
        format!("file:{}", self.path)
    }

    async fn list_playable_events(&self) -> anyhow::Result<Vec<PlayableEvent>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read catalog file {}: {e}", self.path))?;
        let events = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("catalog file {} is not a JSON event list: {e}", self.path))?;
        Ok(events)
    }
}

pub struct HttpContentSource {
    client: reqwest::Client,
    url: String,
}

impl HttpContentSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn list_playable_events(&self) -> anyhow::Result<Vec<PlayableEvent>> {
        let resp = self.client.get(&self.url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// Used when no source is configured: refresh yields an empty catalog.
pub struct NoContentSource;

#[async_trait]
impl ContentSource for NoContentSource {
    fn describe(&self) -> String {
        "none".into()
    }

    async fn list_playable_events(&self) -> anyhow::Result<Vec<PlayableEvent>> {
        Ok(Vec::new())
    }
}
