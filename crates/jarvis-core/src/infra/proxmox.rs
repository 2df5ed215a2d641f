//! Proxmox REST client: per-node API-token auth, TLS verification disabled
//! for the private LAN, and a short TTL cache in front of the hot
//! `/cluster/resources` and `/cluster/status` endpoints shared by the
//! telemetry emitter and the chat context builder.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    config::schema::ProxmoxConfig,
    error::{JarvisError, JarvisResult},
};

/// Unwraps the Proxmox `{data: T}` envelope.
#[derive(serde::Deserialize)]
struct Envelope<T> {
    data: T,
}

struct CacheEntry {
    value: Value,
    fetched_at: Instant,
}

struct TtlCache {
    ttl: Duration,
    entries: Mutex<std::collections::HashMap<String, CacheEntry>>,
}

impl TtlCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().expect("proxmox cache lock poisoned");
        entries.get(key).and_then(|e| {
            if e.fetched_at.elapsed() < self.ttl {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    fn put(&self, key: &str, value: Value) {
        self.entries.lock().expect("proxmox cache lock poisoned").insert(
            key.to_owned(),
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }
}

pub struct ProxmoxNode {
    pub name: String,
    pub host: String,
    pub token_id: String,
}

pub struct ProxmoxClient {
    client: Client,
    nodes: Vec<ProxmoxNode>,
    token_secret: String,
    cache: TtlCache,
}

impl ProxmoxClient {
    pub fn from_config(cfg: &ProxmoxConfig) -> JarvisResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(cfg.tls_insecure)
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| JarvisError::Internal(format!("failed to build proxmox client: {e}")))?;

        let nodes = cfg
            .nodes
            .iter()
            .map(|n| ProxmoxNode {
                name: n.name.clone(),
                host: n.host.clone(),
                token_id: n.token_id.clone(),
            })
            .collect();

        Ok(Self {
            client,
            nodes,
            token_secret: cfg.token_secret.clone(),
            cache: TtlCache::new(Duration::from_secs(cfg.cache_ttl_secs)),
        })
    }

    fn node(&self, name: &str) -> JarvisResult<&ProxmoxNode> {
        self.nodes
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| JarvisError::NotFound(format!("unknown proxmox node '{name}'")))
    }

    /// Resolves a node name to its SSH-reachable host, case-insensitively.
    /// Used by the terminal channel to open a PTY without exposing the
    /// node table itself.
    pub fn resolve_host(&self, name: &str) -> JarvisResult<String> {
        self.node(name).map(|n| n.host.clone())
    }

    fn auth_header(&self, token_id: &str) -> String {
        format!("PVEAPIToken={token_id}={secret}", secret = self.token_secret)
    }

    /// GET `path` against `node`'s API, unwrapping the `{data: T}` envelope.
    /// Bypasses the cache — intended for the rarer, per-node calls.
    pub async fn get<T: DeserializeOwned>(&self, node_name: &str, path: &str) -> JarvisResult<T> {
        let node = self.node(node_name)?;
        let url = format!("https://{}:8006/api2/json{path}", node.host);

        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header(&node.token_id))
            .send()
            .await
            .map_err(|e| JarvisError::Upstream {
                host: node.host.clone(),
                path: path.to_owned(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(JarvisError::Upstream {
                host: node.host.clone(),
                path: path.to_owned(),
                detail: format!("status {}", resp.status()),
            });
        }

        let envelope: Envelope<T> = resp.json().await.map_err(|e| JarvisError::Upstream {
            host: node.host.clone(),
            path: path.to_owned(),
            detail: format!("failed to parse response: {e}"),
        })?;

        Ok(envelope.data)
    }

    /// Cached cluster-wide view, keyed on `path` alone since `/cluster/*`
    /// endpoints are identical from any node's perspective. Hits the first
    /// configured node on a cache miss.
    pub async fn get_cluster_cached(&self, path: &str) -> JarvisResult<Value> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached);
        }

        let first = self
            .nodes
            .first()
            .ok_or_else(|| JarvisError::Internal("no proxmox nodes configured".to_owned()))?;
        let value: Value = self.get(&first.name.clone(), path).await?;
        self.cache.put(path, value.clone());
        Ok(value)
    }

    pub async fn cluster_resources(&self) -> JarvisResult<Value> {
        self.get_cluster_cached("/cluster/resources").await
    }

    pub async fn cluster_status(&self) -> JarvisResult<Value> {
        self.get_cluster_cached("/cluster/status").await
    }

    pub async fn node_status(&self, node_name: &str) -> JarvisResult<Value> {
        self.get(node_name, &format!("/nodes/{node_name}/status"))
            .await
    }

    pub async fn vm_status(&self, node_name: &str, vmid: u64) -> JarvisResult<Value> {
        self.get(
            node_name,
            &format!("/nodes/{node_name}/qemu/{vmid}/status/current"),
        )
        .await
    }

    /// `POST /nodes/:node/qemu/:vmid/status/:action` with an empty body.
    pub async fn vm_action(&self, node_name: &str, vmid: u64, action: &str) -> JarvisResult<Value> {
        let node = self.node(node_name)?;
        let url = format!(
            "https://{}:8006/api2/json/nodes/{node_name}/qemu/{vmid}/status/{action}",
            node.host
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header(&node.token_id))
            .send()
            .await
            .map_err(|e| JarvisError::Upstream {
                host: node.host.clone(),
                path: url.clone(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(JarvisError::Upstream {
                host: node.host.clone(),
                path: url,
                detail: format!("status {}", resp.status()),
            });
        }

        let envelope: Envelope<Value> = resp.json().await.unwrap_or(Envelope { data: Value::Null });
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ProxmoxConfig {
        ProxmoxConfig {
            nodes: vec![crate::config::schema::ProxmoxNodeConfig {
                name: "pve".to_owned(),
                host: "192.168.1.10".to_owned(),
                token_id: "root@pam!jarvis".to_owned(),
            }],
            token_secret: "secret".to_owned(),
            tls_insecure: true,
            request_timeout_secs: 15,
            cache_ttl_secs: 2,
        }
    }

    #[test]
    fn auth_header_format() {
        let client = ProxmoxClient::from_config(&cfg()).unwrap();
        let header = client.auth_header("root@pam!jarvis");
        assert_eq!(header, "PVEAPIToken=root@pam!jarvis=secret");
    }

    #[test]
    fn unknown_node_errors() {
        let client = ProxmoxClient::from_config(&cfg()).unwrap();
        assert!(client.node("ghost").is_err());
    }

    #[test]
    fn node_lookup_is_case_insensitive() {
        let client = ProxmoxClient::from_config(&cfg()).unwrap();
        assert!(client.node("PVE").is_ok());
    }

    #[tokio::test]
    async fn cache_serves_repeat_reads_without_refetch() {
        let client = ProxmoxClient::from_config(&cfg()).unwrap();
        client.cache.put("/cluster/resources", serde_json::json!([1, 2]));
        let cached = client.cache.get("/cluster/resources");
        assert_eq!(cached, Some(serde_json::json!([1, 2])));
    }
}
