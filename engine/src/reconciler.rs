// --- Client reconciler -----------------------------------------------------------
//
// Viewer-side clock: polls `/api/v1/stream/current`, corrects for the round
// trip, and extrapolates the position locally between polls. Every poll
// jump-corrects; there is no gradual drift correction.
//
// Times are local epoch milliseconds; positions are seconds.

use std::time::Duration;

use crate::api::{parse_server_time, CurrentResponse, ItemView};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Corrections smaller than this are treated as clock noise.
const DEFAULT_SEEK_THRESHOLD_SECS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
struct Anchor {
    item: Option<ItemView>,
    position_secs: f64,
    item_duration_secs: f64,
    server_time_ms: f64,
    /// Add to a local clock reading to get the server clock.
    local_offset_ms: f64,
    is_playing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// A different item (or nothing) is on air: the player must load it.
    ItemChanged {
        item: Option<ItemView>,
        position_secs: f64,
    },
    /// Same item but the local estimate was off: seek.
    Seek { from_secs: f64, to_secs: f64 },
    InSync,
}

#[derive(Debug, Clone)]
pub struct ClientReconciler {
    seek_threshold_secs: f64,
    anchor: Option<Anchor>,
    last_latency_ms: Option<f64>,
}

impl Default for ClientReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_SEEK_THRESHOLD_SECS)
    }
}

impl ClientReconciler {
    pub fn new(seek_threshold_secs: f64) -> Self {
        Self {
            seek_threshold_secs: seek_threshold_secs.max(0.0),
            anchor: None,
            last_latency_ms: None,
        }
    }

    /// Fold in one poll: request sent at `t0_ms`, response received at `t1_ms`.
    pub fn apply(&mut self, t0_ms: i64, t1_ms: i64, resp: &CurrentResponse) -> ReconcileOutcome {
        let latency_ms = (t1_ms - t0_ms).max(0) as f64 / 2.0;
        let t1 = t1_ms as f64;

        // Without a readable server time, assume the clocks agree.
        let server_time_ms = parse_server_time(&resp.server_time)
            .map(|ms| ms as f64)
            .unwrap_or(t1 - latency_ms);
        let adjusted_server_time = server_time_ms + latency_ms;

        let next = Anchor {
            item: resp.current_item.clone(),
            position_secs: resp.position_seconds.max(0.0),
            item_duration_secs: resp.item_duration_seconds as f64,
            server_time_ms,
            local_offset_ms: adjusted_server_time - t1,
            is_playing: resp.is_playing,
        };

        let predicted = self.position_at(t1_ms);
        let prev_id = self.anchor.as_ref().and_then(|a| a.item.as_ref().map(|i| i.id.clone()));
        let first = self.anchor.is_none();
        let corrected = next.position_at(t1);

        self.last_latency_ms = Some(latency_ms);
        let item = next.item.clone();
        self.anchor = Some(next);

        if first || prev_id.as_deref() != item.as_ref().map(|i| i.id.as_str()) {
            return ReconcileOutcome::ItemChanged {
                item,
                position_secs: corrected,
            };
        }
        match predicted {
            Some(from) if (from - corrected).abs() > self.seek_threshold_secs => ReconcileOutcome::Seek {
                from_secs: from,
                to_secs: corrected,
            },
            _ => ReconcileOutcome::InSync,
        }
    }

    /// Extrapolated position at local time `now_ms`, using the local clock only.
    pub fn position_at(&self, now_ms: i64) -> Option<f64> {
        self.anchor.as_ref().map(|a| a.position_at(now_ms as f64))
    }

    /// True once the local estimate has run past the end of the item the last
    /// poll reported; the player should show a loading state until the next
    /// poll says what comes next.
    pub fn should_show_buffering(&self, now_ms: i64) -> bool {
        match &self.anchor {
            Some(a) if a.is_playing && a.item.is_some() => a.position_at(now_ms as f64) >= a.item_duration_secs,
            _ => false,
        }
    }

    pub fn current_item(&self) -> Option<&ItemView> {
        self.anchor.as_ref().and_then(|a| a.item.as_ref())
    }

    pub fn last_latency_ms(&self) -> Option<f64> {
        self.last_latency_ms
    }
}

impl Anchor {
    fn position_at(&self, local_ms: f64) -> f64 {
        if !self.is_playing {
            return self.position_secs;
        }
        let server_now = local_ms + self.local_offset_ms;
        (self.position_secs + (server_now - self.server_time_ms) / 1000.0).max(0.0)
    }
}

/// Poll interval plus up to 10% jitter so viewers that started together do
/// not keep hitting the store in lockstep.
pub fn next_poll_delay(base: Duration) -> Duration {
    let jitter_ms = (base.as_millis() / 10) as u64;
    base + Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// HTTP side of the viewer.
pub struct ChannelClient {
    client: reqwest::Client,
    current_url: String,
}

impl ChannelClient {
    pub fn new(server_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            current_url: format!("{}/api/v1/stream/current", server_url.trim_end_matches('/')),
        })
    }

    /// One timed poll: `(t0_ms, t1_ms, response)`.
    pub async fn fetch_current(&self) -> anyhow::Result<(i64, i64, CurrentResponse)> {
        let t0 = crate::unix_ms();
        let resp = self
            .client
            .get(&self.current_url)
            .send()
            .await?
            .error_for_status()?;
        let body: CurrentResponse = resp.json().await?;
        let t1 = crate::unix_ms();
        Ok((t0, t1, body))
    }

    pub async fn sync(&self, reconciler: &mut ClientReconciler) -> anyhow::Result<ReconcileOutcome> {
        let (t0, t1, body) = self.fetch_current().await?;
        Ok(reconciler.apply(t0, t1, &body))
    }
}
