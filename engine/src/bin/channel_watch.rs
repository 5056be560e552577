// Terminal viewer: follows the channel the way a browser player would.
//
// Polls the engine, keeps a latency-corrected local clock between polls and
// prints where playback is each second. Press Enter to resync immediately.

use std::sync::Arc;
use std::time::Duration;

use channel_engine::reconciler::{next_poll_delay, ChannelClient, ClientReconciler, ReconcileOutcome};
use channel_engine::unix_ms;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let server = std::env::var("CHANNEL_SERVER_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());
    let poll_every = std::env::var("CHANNEL_POLL_SECS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(channel_engine::reconciler::DEFAULT_POLL_INTERVAL);

    let client = ChannelClient::new(&server, Duration::from_secs(10))?;
    info!("watching {server} (poll every {}s, Enter = resync)", poll_every.as_secs());

    let resync = Arc::new(Notify::new());
    {
        let resync = resync.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                resync.notify_one();
            }
        });
    }

    let mut reconciler = ClientReconciler::default();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut next_poll = Instant::now();
    let mut buffering = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_poll) => {
                sync(&client, &mut reconciler).await;
                next_poll = Instant::now() + next_poll_delay(poll_every);
            }
            _ = resync.notified() => {
                info!("resync requested");
                sync(&client, &mut reconciler).await;
                next_poll = Instant::now() + next_poll_delay(poll_every);
            }
            _ = tick.tick() => {
                let now = unix_ms();
                let show_buffering = reconciler.should_show_buffering(now);
                if show_buffering && !buffering {
                    info!("item should have ended; buffering until the next poll");
                }
                buffering = show_buffering;
                if let (Some(item), Some(pos), false) = (reconciler.current_item(), reconciler.position_at(now), buffering) {
                    info!("{} @ {}", item.title, mmss(pos));
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

async fn sync(client: &ChannelClient, reconciler: &mut ClientReconciler) {
    match client.sync(reconciler).await {
        Ok(ReconcileOutcome::ItemChanged { item: Some(item), position_secs }) => {
            info!("now playing {} ({}) from {}", item.title, item.playable_ref, mmss(position_secs));
        }
        Ok(ReconcileOutcome::ItemChanged { item: None, .. }) => info!("channel has no content"),
        Ok(ReconcileOutcome::Seek { from_secs, to_secs }) => {
            info!("seek {} -> {}", mmss(from_secs), mmss(to_secs));
        }
        Ok(ReconcileOutcome::InSync) => {
            if let Some(ms) = reconciler.last_latency_ms() {
                tracing::debug!("in sync (one-way latency ~{ms:.0} ms)");
            }
        }
        Err(e) => warn!("poll failed, keeping local clock: {e}"),
    }
}

fn mmss(secs: f64) -> String {
    let s = secs.max(0.0) as u64;
    format!("{}:{:02}", s / 60, s % 60)
}
