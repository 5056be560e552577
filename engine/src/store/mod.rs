// --- Shared state store ------------------------------------------------------
//
// The reference state and the catalog snapshot are each one JSON value under
// one key. Every backend replaces a value whole; there are no field-level
// writes, so concurrent instances can only ever observe a complete record.
//
// Backends:
//   - sqlite : a WAL-mode file shared by every instance on one host
//   - rest   : Redis-over-HTTP (Upstash-compatible) for multi-host deployments
//   - memory : process-local with expiry; stands in for a shared backend in
//              tests (the degraded fallback is the coordinator's own mirror)

use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod rest;
mod sqlite;

pub use memory::MemoryStore;
pub use rest::RestStore;
pub use sqlite::SqliteStore;

pub const STATE_KEY: &str = "channel:sync-state";
pub const PLAYLIST_KEY: &str = "channel:playlist";

#[async_trait]
pub trait SharedStateStore: Send + Sync {
    /// Short backend name for logs and the operator endpoints.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Write `value` and (re)arm its expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Re-arm the expiry of an existing key without rewriting it.
    async fn touch(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;
}
