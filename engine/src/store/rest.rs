// Redis-over-HTTP store (Upstash REST protocol).
//
//   GET  {base}/get/{key}               -> {"result": "<value>" | null}
//   POST {base}/set/{key}?EX={secs}     -> {"result": "OK"}   (body = value)
//   GET  {base}/expire/{key}/{secs}     -> {"result": 0 | 1}
//
// Errors come back as {"error": "..."} with a non-2xx status.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::SharedStateStore;

pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct RestReply {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

impl RestStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        let reply: RestReply = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("store reply was not JSON (status {status}): {e}"))?;
        if let Some(err) = reply.error {
            anyhow::bail!("store error (status {status}): {err}");
        }
        if !status.is_success() {
            anyhow::bail!("store returned status {status}");
        }
        Ok(reply.result)
    }
}

#[async_trait]
impl SharedStateStore for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let url = format!("{}/get/{}", self.base_url, key);
        match self.send(self.client.get(url)).await? {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(s) => Ok(Some(s)),
            // Some clients store JSON natively; hand it back as text.
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let url = format!("{}/set/{}", self.base_url, key);
        let req = self
            .client
            .post(url)
            .query(&[("EX", ttl.as_secs().max(1))])
            .body(value.to_string());
        self.send(req).await?;
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let url = format!("{}/expire/{}/{}", self.base_url, key, ttl.as_secs().max(1));
        self.send(self.client.get(url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> RestStore {
        RestStore::new(&server.uri(), Some("secret".into()), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn get_returns_string_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get/channel:sync-state"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "{\"a\":1}"})))
            .mount(&server)
            .await;

        let v = store(&server).get("channel:sync-state").await.unwrap();
        assert_eq!(v.as_deref(), Some("{\"a\":1}"));
    }

    #[tokio::test]
    async fn get_null_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get/channel:playlist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": null})))
            .mount(&server)
            .await;

        assert_eq!(store(&server).get("channel:playlist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_sends_ttl_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/set/channel:sync-state"))
            .and(query_param("EX", "86400"))
            .and(body_string("{\"x\":true}"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "OK"})))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .set("channel:sync-state", "{\"x\":true}", Duration::from_secs(86_400))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn error_envelope_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/expire/channel:playlist/60"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "Unauthorized"})))
            .mount(&server)
            .await;

        let err = store(&server)
            .touch("channel:playlist", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }
}
