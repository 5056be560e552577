// Duration probing via ffprobe.
//
// ffprobe accepts local paths and http(s) URLs alike, so the playable
// reference is passed through as-is. YouTube page URLs are not media and
// simply fail to probe; those items keep the default until `set-duration`.

use std::time::Duration;

use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

pub async fn probe_duration_seconds(ffprobe: &str, input: &str) -> Option<u32> {
    let out = Command::new(ffprobe)
        .arg("-v").arg("error")
        .arg("-show_entries").arg("format=duration")
        .arg("-of").arg("default=noprint_wrappers=1:nokey=1")
        .arg(input)
        .kill_on_drop(true)
        .output();

    let out = match tokio::time::timeout(PROBE_TIMEOUT, out).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            tracing::debug!("ffprobe could not be started for {input}: {e}");
            return None;
        }
        Err(_) => {
            tracing::debug!("ffprobe timed out for {input}");
            return None;
        }
    };

    if !out.status.success() {
        return None;
    }
    parse_probe_output(&String::from_utf8_lossy(&out.stdout))
}

fn parse_probe_output(s: &str) -> Option<u32> {
    let secs_f: f64 = s.trim().parse().ok()?;
    if !secs_f.is_finite() || secs_f <= 0.0 {
        return None;
    }
    Some((secs_f.round() as u32).max(1))
}
