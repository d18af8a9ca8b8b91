//! Tdarr control client.
//!
//! Pause and resume go through the global `pauseAllNodes` setting in Tdarr's
//! CRUD DB endpoint. Worker cancellation scans `get-nodes` for workers with
//! an assigned file and posts `cancel-worker-item` for each. Tdarr picks the
//! cancelled items up again on resume, so nothing needs undoing.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::controller::CallError;

/// The external system the controller pauses and resumes, abstracted so the
/// controller can be exercised against a fake in tests.
#[async_trait::async_trait]
pub trait TranscodeTarget: Send + Sync {
    /// Set the global paused flag. Idempotent on the Tdarr side: setting a
    /// flag to its current value is acknowledged as success.
    async fn set_paused(&self, paused: bool) -> Result<(), CallError>;

    /// Cancel in-flight worker items. Returns the number of cancel requests
    /// that were acknowledged.
    async fn cancel_active_workers(&self) -> Result<u32, CallError>;
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TdarrClient {
    client: Client,
    base_url: String,
}

impl TdarrClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Tdarr HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Body for the `cruddb` update that flips `pauseAllNodes`.
fn pause_body(paused: bool) -> Value {
    json!({
        "data": {
            "collection": "SettingsGlobalJSONDB",
            "mode": "update",
            "docID": "globalsettings",
            "obj": { "pauseAllNodes": paused }
        },
        "timeout": 20_000
    })
}

fn cancel_body(node_id: &str, worker_id: &str) -> Value {
    json!({
        "data": {
            "nodeID": node_id,
            "workerID": worker_id,
            "cause": "Paused while playback is active"
        }
    })
}

/// Scan a `get-nodes` payload for workers with an assigned file.
///
/// Returns `(node_id, worker_id, file)` triples. Malformed node or worker
/// entries are skipped with a warning rather than failing the scan.
pub fn active_workers(nodes: &Value) -> Vec<(String, String, String)> {
    let Some(nodes) = nodes.as_object() else {
        warn!("unexpected get-nodes payload, expected an object of nodes");
        return Vec::new();
    };

    let mut found = Vec::new();
    for (node_id, node) in nodes {
        let Some(node) = node.as_object() else {
            warn!(node = %node_id, "node entry is not an object, skipping");
            continue;
        };
        let Some(workers) = node.get("workers").and_then(Value::as_object) else {
            debug!(node = %node_id, "node has no workers map");
            continue;
        };
        for (worker_id, worker) in workers {
            let Some(worker) = worker.as_object() else {
                warn!(node = %node_id, worker = %worker_id, "worker entry is not an object, skipping");
                continue;
            };
            // A non-null "file" means the worker is mid-transcode.
            match worker.get("file") {
                Some(file) if !file.is_null() => {
                    let file = file.as_str().unwrap_or("<non-string file>").to_string();
                    found.push((node_id.clone(), worker_id.clone(), file));
                }
                _ => {
                    debug!(node = %node_id, worker = %worker_id, "worker idle");
                }
            }
        }
    }
    found
}

#[async_trait::async_trait]
impl TranscodeTarget for TdarrClient {
    async fn set_paused(&self, paused: bool) -> Result<(), CallError> {
        let response = self
            .client
            .post(self.url("/api/v2/cruddb"))
            .json(&pause_body(paused))
            .send()
            .await
            .map_err(CallError::from_reqwest)?;
        response.error_for_status().map_err(CallError::from_reqwest)?;
        info!(paused, "tdarr pauseAllNodes updated");
        Ok(())
    }

    async fn cancel_active_workers(&self) -> Result<u32, CallError> {
        let response = self
            .client
            .get(self.url("/api/v2/get-nodes"))
            .send()
            .await
            .map_err(CallError::from_reqwest)?
            .error_for_status()
            .map_err(CallError::from_reqwest)?;
        let nodes: Value = response.json().await.map_err(CallError::from_reqwest)?;

        let mut cancelled = 0u32;
        for (node_id, worker_id, file) in active_workers(&nodes) {
            info!(node = %node_id, worker = %worker_id, file = %file, "cancelling active worker item");
            let result = self
                .client
                .post(self.url("/api/v2/cancel-worker-item"))
                .json(&cancel_body(&node_id, &worker_id))
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => cancelled += 1,
                Err(e) => {
                    // Best effort: one stuck worker should not stop the rest.
                    warn!(node = %node_id, worker = %worker_id, error = %e, "failed to cancel worker item");
                }
            }
        }

        if cancelled > 0 {
            info!(cancelled, "cancelled active worker items");
        } else {
            debug!("no active worker items found");
        }
        Ok(cancelled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_body_shape() {
        let body = pause_body(true);
        assert_eq!(body["data"]["collection"], "SettingsGlobalJSONDB");
        assert_eq!(body["data"]["mode"], "update");
        assert_eq!(body["data"]["docID"], "globalsettings");
        assert_eq!(body["data"]["obj"]["pauseAllNodes"], true);
        assert_eq!(body["timeout"], 20_000);

        let body = pause_body(false);
        assert_eq!(body["data"]["obj"]["pauseAllNodes"], false);
    }

    #[test]
    fn test_cancel_body_shape() {
        let body = cancel_body("node-1", "worker-7");
        assert_eq!(body["data"]["nodeID"], "node-1");
        assert_eq!(body["data"]["workerID"], "worker-7");
        assert!(body["data"]["cause"].is_string());
    }

    #[test]
    fn test_active_workers_finds_busy_workers() {
        let nodes = json!({
            "node-a": {
                "workers": {
                    "w1": { "file": "/media/movie.mkv" },
                    "w2": { "file": null },
                    "w3": {}
                }
            },
            "node-b": {
                "workers": {
                    "w4": { "file": "/media/show.mkv" }
                }
            }
        });
        let mut found = active_workers(&nodes);
        found.sort();
        assert_eq!(
            found,
            vec![
                (
                    "node-a".to_string(),
                    "w1".to_string(),
                    "/media/movie.mkv".to_string()
                ),
                (
                    "node-b".to_string(),
                    "w4".to_string(),
                    "/media/show.mkv".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_active_workers_tolerates_malformed_entries() {
        let nodes = json!({
            "bad-node": "not an object",
            "no-workers": { "status": "idle" },
            "bad-workers": { "workers": [1, 2, 3] },
            "ok": { "workers": { "w1": { "file": "/a.mkv" }, "w2": 42 } }
        });
        let found = active_workers(&nodes);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "ok");
    }

    #[test]
    fn test_active_workers_non_object_payload() {
        assert!(active_workers(&json!([1, 2, 3])).is_empty());
        assert!(active_workers(&json!(null)).is_empty());
    }
}
