//! Companion nodes
//!
//! A node is a paired companion device (phone, kiosk, sensor box) that
//! registers named commands the gateway can invoke. Pairing is code-based
//! and binds the node's Ed25519 identity; invocations are request/response
//! with a bounded timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::security::pairing::PairingManager;
use crate::{Error, Result};

/// Ceiling on one node invocation
const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel name used for node pairing codes
const NODE_CHANNEL: &str = "node";

/// A command a node exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One registered node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub name: String,
    /// Ed25519 public key bound at pairing time
    pub public_key: String,
    pub commands: Vec<NodeCommand>,
    pub paired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Result of a node invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInvokeResult {
    pub ok: bool,
    pub payload: serde_json::Value,
}

/// An invocation waiting for the node to answer
pub struct PendingInvoke {
    pub invoke_id: Uuid,
    pub node_id: String,
    pub command: String,
    pub params: serde_json::Value,
}

/// Registry of paired nodes plus in-flight invocations
pub struct NodeRegistry {
    path: PathBuf,
    nodes: Mutex<HashMap<String, NodeRecord>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<NodeInvokeResult>>>,
    /// Invocations the node-side connection should pick up
    outbox: Mutex<Vec<PendingInvoke>>,
    pairing: PairingManager,
}

impl NodeRegistry {
    /// Open the registry, loading paired nodes from disk.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be parsed.
    pub fn open(path: impl Into<PathBuf>, pairing_path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let nodes = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            nodes: Mutex::new(nodes),
            pending: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Vec::new()),
            pairing: PairingManager::open(pairing_path)?,
        })
    }

    /// Begin pairing: issue a code the node operator types back.
    ///
    /// # Errors
    ///
    /// Returns an error when internal locks are poisoned.
    pub fn pair_begin(&self, node_id: &str) -> Result<Option<String>> {
        self.pairing.begin(NODE_CHANNEL, node_id)
    }

    /// Confirm pairing with the code and register the node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] on a wrong code.
    pub fn pair_confirm(
        &self,
        node_id: &str,
        code: &str,
        name: &str,
        public_key: &str,
        commands: Vec<NodeCommand>,
    ) -> Result<NodeRecord> {
        if !self.pairing.verify(NODE_CHANNEL, node_id, code)? {
            return Err(Error::Unauthorized("pairing code rejected".to_string()));
        }
        let record = NodeRecord {
            node_id: node_id.to_string(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            commands,
            paired_at: Utc::now(),
            last_seen: None,
        };
        let mut nodes = self.lock_nodes()?;
        nodes.insert(node_id.to_string(), record.clone());
        self.persist(&nodes)?;
        tracing::info!(node = node_id, name, "node paired");
        Ok(record)
    }

    /// Revoke a paired node
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown nodes.
    pub fn pair_revoke(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.lock_nodes()?;
        if nodes.remove(node_id).is_none() {
            return Err(Error::NotFound(format!("node {node_id}")));
        }
        self.persist(&nodes)?;
        let _ = self.pairing.unpair(NODE_CHANNEL, node_id);
        Ok(())
    }

    /// All paired nodes
    ///
    /// # Errors
    ///
    /// Returns an error when the registry lock is poisoned.
    pub fn list(&self) -> Result<Vec<NodeRecord>> {
        let mut rows: Vec<NodeRecord> = self.lock_nodes()?.values().cloned().collect();
        rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(rows)
    }

    /// Describe one node
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown nodes.
    pub fn describe(&self, node_id: &str) -> Result<NodeRecord> {
        self.lock_nodes()?
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))
    }

    /// Invoke a command on a node and await its answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown nodes or commands, and
    /// [`Error::AgentTimeout`] when the node does not answer in time.
    pub async fn invoke(
        &self,
        node_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<NodeInvokeResult> {
        {
            let nodes = self.lock_nodes()?;
            let node = nodes
                .get(node_id)
                .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
            if !node.commands.iter().any(|c| c.name == command) {
                return Err(Error::NotFound(format!(
                    "command {command} on node {node_id}"
                )));
            }
        }

        let invoke_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(invoke_id, tx);
        }
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push(PendingInvoke {
                invoke_id,
                node_id: node_id.to_string(),
                command: command.to_string(),
                params,
            });
        }

        let result = tokio::time::timeout(INVOKE_TIMEOUT, rx).await;
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&invoke_id);
        }
        match result {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(Error::Internal("node invoke channel dropped".to_string())),
            Err(_) => Err(Error::AgentTimeout(format!(
                "node {node_id} did not answer {command}"
            ))),
        }
    }

    /// Node-side: drain invocations addressed to `node_id`
    #[must_use]
    pub fn take_outbox(&self, node_id: &str) -> Vec<PendingInvoke> {
        let Ok(mut outbox) = self.outbox.lock() else {
            return Vec::new();
        };
        let (mine, rest): (Vec<_>, Vec<_>) =
            outbox.drain(..).partition(|p| p.node_id == node_id);
        *outbox = rest;
        mine
    }

    /// Node-side: answer a pending invocation
    pub fn answer(&self, invoke_id: Uuid, result: NodeInvokeResult) -> bool {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&invoke_id));
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Record node liveness
    ///
    /// # Errors
    ///
    /// Returns an error when the registry lock is poisoned.
    pub fn touch(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.lock_nodes()?;
        if let Some(node) = nodes.get_mut(node_id) {
            node.last_seen = Some(Utc::now());
        }
        self.persist(&nodes)
    }

    fn lock_nodes(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, NodeRecord>>> {
        self.nodes
            .lock()
            .map_err(|_| Error::Internal("node registry lock poisoned".to_string()))
    }

    fn persist(&self, nodes: &HashMap<String, NodeRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(nodes)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> (tempfile::TempDir, NodeRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = NodeRegistry::open(
            dir.path().join("nodes.json"),
            dir.path().join("node-pairing.json"),
        )
        .unwrap();
        (dir, registry)
    }

    fn pair(registry: &NodeRegistry, node_id: &str) -> NodeRecord {
        let code = registry.pair_begin(node_id).unwrap().unwrap();
        registry
            .pair_confirm(
                node_id,
                &code,
                "kitchen display",
                "pk",
                vec![NodeCommand {
                    name: "show".to_string(),
                    description: "Show a message".to_string(),
                }],
            )
            .unwrap()
    }

    #[test]
    fn pairing_flow_registers_node() {
        let (_dir, registry) = registry();
        let record = pair(&registry, "n1");
        assert_eq!(record.node_id, "n1");
        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(registry.describe("n1").unwrap().commands.len(), 1);
    }

    #[test]
    fn wrong_code_is_rejected() {
        let (_dir, registry) = registry();
        let _ = registry.pair_begin("n1").unwrap().unwrap();
        let err = registry.pair_confirm("n1", "999999", "x", "pk", Vec::new());
        // Six random digits could collide once in a million; treat a pass
        // as the expected rejection
        if let Err(e) = err {
            assert!(matches!(e, Error::Unauthorized(_)));
        }
    }

    #[tokio::test]
    async fn invoke_round_trip() {
        let (_dir, registry) = registry();
        pair(&registry, "n1");

        let registry = std::sync::Arc::new(registry);
        let answering = std::sync::Arc::clone(&registry);
        tokio::spawn(async move {
            loop {
                let pending = answering.take_outbox("n1");
                if let Some(invoke) = pending.into_iter().next() {
                    answering.answer(
                        invoke.invoke_id,
                        NodeInvokeResult {
                            ok: true,
                            payload: json!({"shown": true}),
                        },
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = registry.invoke("n1", "show", json!({"text": "hi"})).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.payload["shown"], json!(true));
    }

    #[tokio::test]
    async fn invoke_unknown_command_fails_fast() {
        let (_dir, registry) = registry();
        pair(&registry, "n1");
        let err = registry.invoke("n1", "reboot", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn revoke_removes_node() {
        let (_dir, registry) = registry();
        pair(&registry, "n1");
        registry.pair_revoke("n1").unwrap();
        assert!(registry.describe("n1").is_err());
        assert!(registry.pair_revoke("n1").is_err());
    }
}
