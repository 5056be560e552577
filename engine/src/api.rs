// --- HTTP API ------------------------------------------------------------------
//
// Stream endpoints are read by every viewer every few seconds and must never
// be cached by a proxy or the browser: each response is live computed state.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderValue},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sysinfo::System;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::debug;
use uuid::Uuid;

use crate::coordinator::{ChannelView, StoreStatus, SyncCoordinator};
use crate::error::ApiError;
use crate::playlist::{Playlist, PlaylistItem};
use crate::scheduler::PlaybackState;
use crate::unix_ms;

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    /// Distinguishes instances behind a load balancer in logs and `/ping`.
    pub instance_id: Uuid,
    pub sys: Arc<tokio::sync::Mutex<System>>,
    pub coordinator: Arc<SyncCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: Uuid::new_v4(),
            sys: Arc::new(tokio::sync::Mutex::new(System::new())),
            coordinator,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let stream = Router::new()
        .route("/api/v1/stream/current", get(stream_current))
        .route("/api/v1/stream/playlist", get(playlist_get).post(playlist_post))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, max-age=0"),
        ));

    Router::new()
        .merge(stream)
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/system/info", get(system_info))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Wire types ------------------------------------------------------------------

/// The media-facing view of an item: what a player needs to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub id: String,
    pub title: String,
    pub playable_ref: String,
}

impl From<&PlaylistItem> for ItemView {
    fn from(it: &PlaylistItem) -> Self {
        Self {
            id: it.id.clone(),
            title: it.title.clone(),
            playable_ref: it.playable_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub playable_ref: String,
    /// Effective length: override, upstream value or the default.
    pub duration_seconds: u32,
    pub duration_known: bool,
}

/// Response of `GET /api/v1/stream/current`; also what the viewer decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentResponse {
    pub current_item: Option<ItemView>,
    pub current_index: usize,
    pub offset_seconds: u64,
    /// Same position with sub-second precision.
    pub position_seconds: f64,
    pub is_playing: bool,
    pub total_items: usize,
    pub total_duration_seconds: u64,
    pub next_item: Option<ItemView>,
    pub remaining_seconds: u64,
    pub item_duration_seconds: u32,
    pub server_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<Vec<PlaylistEntry>>,
}

impl CurrentResponse {
    pub fn from_view(view: &ChannelView, default_secs: u32, include_playlist: bool) -> Self {
        let st = &view.state;
        Self {
            current_item: st.current_item.as_ref().map(ItemView::from),
            current_index: st.current_index,
            offset_seconds: st.offset_within_item,
            position_seconds: st.offset_within_item_ms as f64 / 1000.0,
            is_playing: st.is_playing,
            total_items: view.playlist.len(),
            total_duration_seconds: st.total_duration_secs,
            next_item: st.next_item.as_ref().map(ItemView::from),
            remaining_seconds: st.remaining_seconds_in_item,
            item_duration_seconds: st.item_duration_secs,
            server_time: format_server_time(view.server_time_ms),
            playlist: include_playlist.then(|| playlist_entries(&view.playlist, default_secs)),
        }
    }
}

pub fn format_server_time(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}

pub fn parse_server_time(s: &str) -> Option<i64> {
    let t = OffsetDateTime::parse(s, &Rfc3339).ok()?;
    Some((t.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn playlist_entries(playlist: &Playlist, default_secs: u32) -> Vec<PlaylistEntry> {
    playlist
        .items()
        .iter()
        .enumerate()
        .map(|(i, it)| PlaylistEntry {
            id: it.id.clone(),
            title: it.title.clone(),
            playable_ref: it.playable_ref.clone(),
            duration_seconds: playlist.effective_duration(i, default_secs),
            duration_known: !playlist.lacks_duration(i),
        })
        .collect()
}

fn state_json(st: &PlaybackState) -> Value {
    json!({
        "currentItemId": st.current_item_id(),
        "currentIndex": st.current_index,
        "offsetSeconds": st.offset_within_item,
        "isPlaying": st.is_playing,
    })
}

// --- Stream handlers -------------------------------------------------------------

#[derive(Deserialize, Default)]
struct CurrentQuery {
    #[serde(default, alias = "includePlaylist")]
    include_playlist: Option<bool>,
}

async fn stream_current(
    State(state): State<AppState>,
    Query(q): Query<CurrentQuery>,
) -> Json<CurrentResponse> {
    let view = state.coordinator.current(unix_ms()).await;
    let default_secs = state.coordinator.scheduler().default_duration_secs();
    Json(CurrentResponse::from_view(&view, default_secs, q.include_playlist.unwrap_or(false)))
}

async fn playlist_get(State(state): State<AppState>) -> Json<Value> {
    let view = state.coordinator.current(unix_ms()).await;
    let default_secs = state.coordinator.scheduler().default_duration_secs();
    Json(json!({
        "success": true,
        "items": playlist_entries(&view.playlist, default_secs),
        "totalItems": view.playlist.len(),
        "totalDurationSeconds": view.playlist.total_duration(default_secs),
        "currentIndex": view.state.current_index,
        "defaultDurationSeconds": default_secs,
    }))
}

/// Body of `POST /api/v1/stream/playlist`, discriminated by `action`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum PlaylistAction {
    Refresh,
    /// Entries are kept as raw JSON so malformed ones can be dropped
    /// individually instead of failing the whole request.
    Set {
        #[serde(alias = "playlist")]
        items: Vec<Value>,
    },
    Add {
        item: PlaylistItem,
    },
    Remove {
        #[serde(alias = "itemId")]
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    SetDuration {
        #[serde(alias = "itemId")]
        id: String,
        #[serde(alias = "duration")]
        duration_seconds: u32,
    },
    #[serde(rename_all = "camelCase")]
    ForceSync {
        #[serde(alias = "id")]
        item_id: String,
        #[serde(default)]
        offset_seconds: f64,
    },
    Pause,
    Play,
}

const ACTIONS: &[&str] = &["refresh", "set", "add", "remove", "set-duration", "force-sync", "pause", "play"];

fn parse_action(body: Value) -> Result<PlaylistAction, ApiError> {
    let name = body
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("missing \"action\"".into()))?;
    if !ACTIONS.contains(&name) {
        return Err(ApiError::BadRequest(format!("unknown action: {name}")));
    }
    let name = name.to_string();
    serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("invalid {name} payload: {e}")))
}

async fn playlist_post(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let action = parse_action(body)?;
    let c = &state.coordinator;
    let now = unix_ms();
    debug!(?action, "playlist action");

    let reply = match action {
        PlaylistAction::Refresh => {
            let n = c.refresh(now).await?;
            json!({ "success": true, "action": "refresh", "totalItems": n })
        }
        PlaylistAction::Set { items } => {
            let received = items.len();
            let items: Vec<PlaylistItem> = items
                .into_iter()
                .filter_map(|v| serde_json::from_value::<PlaylistItem>(v).ok())
                .collect();
            let n = c.set_playlist(items, now).await;
            json!({ "success": true, "action": "set", "totalItems": n, "dropped": received - n.min(received) })
        }
        PlaylistAction::Add { item } => {
            let n = c.add(item, now).await?;
            json!({ "success": true, "action": "add", "totalItems": n })
        }
        PlaylistAction::Remove { id } => {
            let n = c.remove(&id, now).await?;
            json!({ "success": true, "action": "remove", "totalItems": n })
        }
        PlaylistAction::SetDuration { id, duration_seconds } => {
            c.set_duration(&id, duration_seconds, now).await?;
            json!({ "success": true, "action": "set-duration", "id": id, "durationSeconds": duration_seconds })
        }
        PlaylistAction::ForceSync { item_id, offset_seconds } => {
            let st = c.force_sync(&item_id, offset_seconds, now).await?;
            json!({ "success": true, "action": "force-sync", "state": state_json(&st) })
        }
        PlaylistAction::Pause => {
            let st = c.pause(now).await;
            json!({ "success": true, "action": "pause", "state": state_json(&st) })
        }
        PlaylistAction::Play => {
            let st = c.play(now).await;
            json!({ "success": true, "action": "play", "state": state_json(&st) })
        }
    };
    Ok(Json(reply))
}

// --- Operator endpoints ------------------------------------------------------------

async fn ping(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": state.version,
        "instanceId": state.instance_id,
        "store": state.coordinator.store_status(),
    }))
}

#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    instance_id: Uuid,
    arch: String,
    cpu_model: String,
    cpu_cores: usize,
    load_1m: f32,
    load_5m: f32,
    load_15m: f32,
    hostname: Option<String>,
    store: StoreStatus,
}

async fn system_info(State(st): State<AppState>) -> Json<SystemInfo> {
    let (cpu_model, cpu_cores) = {
        let mut sys = st.sys.lock().await;
        sys.refresh_cpu_all();
        let model = sys
            .cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_else(|| "Unknown CPU".to_string());
        (model, sys.cpus().len())
    };
    let la = System::load_average();

    Json(SystemInfo {
        name: "Channel Engine".to_string(),
        version: st.version.clone(),
        instance_id: st.instance_id,
        arch: std::env::consts::ARCH.to_string(),
        cpu_model,
        cpu_cores,
        load_1m: la.one as f32,
        load_5m: la.five as f32,
        load_15m: la.fifteen as f32,
        hostname: System::host_name(),
        store: st.coordinator.store_status(),
    })
}
