//! Outbound lookup client for user keys and container inventory.
//!
//! Speaks plain HTTP GET with a signed query string (see `sign`), a 10-second
//! overall timeout, no retries, and response compression disabled.

use std::time::Duration;

use serde::Deserialize;

use super::sign::FormData;
use crate::error::{Error, Result};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Response envelope common to every lookup endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[allow(dead_code)]
    error: i64,
    #[allow(dead_code)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A registered public key for one user.
#[derive(Debug, Clone, Deserialize)]
pub struct UserKey {
    pub title: String,
    pub public_key: String,
    pub fingerprint: String,
}

/// One inventory group: a pod on a node with its containers, in order.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerGroup {
    #[serde(rename = "pod_name")]
    pub pod: String,
    #[serde(rename = "node_name")]
    pub node: String,
    #[serde(rename = "container_name", default)]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base: String,
    secret: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .no_gzip()
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;
        Ok(Self {
            base: base.into(),
            secret: secret.into(),
            http,
        })
    }

    /// Public keys registered for `username`.
    pub async fn user_keys(&self, username: &str) -> Result<Vec<UserKey>> {
        self.get("/userinfo/keys", username).await
    }

    /// Container inventory visible to `username`.
    pub async fn user_pods(&self, username: &str) -> Result<Vec<ContainerGroup>> {
        self.get("/userinfo/pods", username).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, username: &str) -> Result<T> {
        let query = FormData::new()
            .with("username", username)
            .signed_query(&self.secret);
        let url = format!("{}{}?{}", self.base, path, query);
        tracing::debug!(url = %url, "lookup");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Client(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Client(e.to_string()))?;
        if status != reqwest::StatusCode::OK {
            return Err(Error::Client(body));
        }

        let envelope: Envelope =
            serde_json::from_str(&body).map_err(|e| Error::Client(e.to_string()))?;
        serde_json::from_value(envelope.data).map_err(|e| Error::Client(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_envelope() {
        let body = r#"{
            "error": 0,
            "msg": "ok",
            "data": [
                {"title": "laptop", "public_key": "ssh-rsa AAAA...", "fingerprint": "ab:cd"}
            ]
        }"#;
        let envelope: Envelope = serde_json::from_str(body).unwrap();
        let keys: Vec<UserKey> = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].title, "laptop");
    }

    #[test]
    fn parses_pod_envelope() {
        let body = r#"{
            "error": 0,
            "msg": "",
            "data": [
                {"pod_name": "p1", "node_name": "n1", "container_name": ["c0", "c1"]},
                {"pod_name": "p2", "node_name": "n2"}
            ]
        }"#;
        let envelope: Envelope = serde_json::from_str(body).unwrap();
        let groups: Vec<ContainerGroup> = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(groups[0].containers, vec!["c0", "c1"]);
        assert!(groups[1].containers.is_empty());
    }
}
