//! Removal of the node readiness taint.
//!
//! Nodes join the cluster tainted so that no pod using the driver is
//! scheduled before the node plugin runs. Once the plugin is serving, the
//! taint is removed, retrying until the API server accepts the change.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

/// Taint applied to nodes until the driver is ready.
pub const AGENT_NOT_READY_TAINT_KEY: &str = "efs.csi.aws.com/agent-not-ready";

/// Environment variable naming the node this plugin runs on.
pub const NODE_NAME_ENV: &str = "CSI_NODE_NAME";

/// Interval between removal attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TaintError {
    #[error("{NODE_NAME_ENV} is not set")]
    MissingNodeName,

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Removes the readiness taint from this node.
#[async_trait]
pub trait TaintRemover: Send + Sync {
    /// Returns `Ok(true)` when a taint was removed, `Ok(false)` when none
    /// was present.
    async fn remove_taint(&self) -> Result<bool, TaintError>;
}

/// [`TaintRemover`] backed by the in-cluster Kubernetes API.
pub struct KubeTaintRemover {
    nodes: Api<Node>,
    node_name: String,
}

impl KubeTaintRemover {
    /// Build from the pod environment: `CSI_NODE_NAME` and the in-cluster
    /// (or kubeconfig) client configuration.
    pub async fn from_env() -> Result<Self, TaintError> {
        let node_name = std::env::var(NODE_NAME_ENV)
            .ok()
            .filter(|name| !name.is_empty())
            .ok_or(TaintError::MissingNodeName)?;
        let client = Client::try_default().await?;
        Ok(Self {
            nodes: Api::all(client),
            node_name,
        })
    }
}

#[async_trait]
impl TaintRemover for KubeTaintRemover {
    async fn remove_taint(&self) -> Result<bool, TaintError> {
        let node = self.nodes.get(&self.node_name).await?;
        let taints = node
            .spec
            .and_then(|spec| spec.taints)
            .unwrap_or_default();

        let before = taints.len();
        let remaining: Vec<_> = taints
            .into_iter()
            .filter(|taint| taint.key != AGENT_NOT_READY_TAINT_KEY)
            .collect();
        if remaining.len() == before {
            debug!(node = %self.node_name, "No readiness taint present");
            return Ok(false);
        }

        // The resource version makes the patch fail on a concurrent update
        let patch = json!({
            "metadata": { "resourceVersion": node.metadata.resource_version },
            "spec": { "taints": remaining },
        });
        self.nodes
            .patch(&self.node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!(node = %self.node_name, taint = AGENT_NOT_READY_TAINT_KEY, "Removed readiness taint");
        Ok(true)
    }
}

/// Call `remover` every `interval` until it succeeds.
pub async fn remove_taint_until_success(remover: &dyn TaintRemover, interval: Duration) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match remover.remove_taint().await {
            Ok(_) => return,
            Err(e) => {
                warn!(attempt, error = %e, "Failed to remove readiness taint, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then succeeds.
    struct FlakyRemover {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaintRemover for FlakyRemover {
        async fn remove_taint(&self) -> Result<bool, TaintError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(TaintError::MissingNodeName)
            } else {
                Ok(true)
            }
        }
    }

    #[tokio::test]
    async fn test_remove_taint_retries_until_success() {
        let remover = FlakyRemover {
            failures: 3,
            calls: AtomicU32::new(0),
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            remove_taint_until_success(&remover, Duration::from_millis(10)),
        )
        .await
        .expect("removal finished");

        assert_eq!(remover.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_remove_taint_stops_after_first_success() {
        let remover = FlakyRemover {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        remove_taint_until_success(&remover, Duration::from_millis(10)).await;
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
    }
}
