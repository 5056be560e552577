use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::SharedStateStore;

/// Process-local store. Only consistent within one instance.
#[derive(Default)]
pub struct MemoryStore {
    entries: tokio::sync::Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStateStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some((_, expires)) = entries.get_mut(key) {
            if *expires > Instant::now() {
                *expires = Instant::now() + ttl;
            }
        }
        Ok(())
    }
}
