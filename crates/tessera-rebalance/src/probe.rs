use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use tessera_types::MetaError;

use crate::keys::TablePartitionId;

/// "Does this node hold the partition's data yet?"
///
/// Implemented by the replication layer. The coordinator treats it as a
/// best-effort probe: errors and timeouts count as "not yet".
pub trait DataProbe: Send + Sync + 'static {
    fn has_data(
        &self,
        node: &str,
        table_id: u32,
        partition_id: u32,
    ) -> impl Future<Output = Result<bool, MetaError>> + Send;
}

/// Retry policy for has-data probes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatchUpPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Per-probe deadline.
    pub probe_timeout_ms: u64,
    /// Probe rounds before the partition is parked. `None` polls forever.
    pub max_attempts: Option<u32>,
}

impl Default for CatchUpPolicy {
    fn default() -> Self {
        CatchUpPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            probe_timeout_ms: 5_000,
            max_attempts: None,
        }
    }
}

impl CatchUpPolicy {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            multiplier: self.multiplier.max(1.0),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        // Non-finite or overflowing products saturate at the cap.
        self.next = Duration::try_from_secs_f64(self.next.as_secs_f64() * self.multiplier)
            .map_or(self.max, |next| next.min(self.max));
        delay
    }
}

/// Probe `nodes` until every one reports data, re-probing only the nodes
/// still missing. Returns `false` once `max_attempts` rounds fail.
pub(crate) async fn wait_for_data<P: DataProbe>(
    probe: &P,
    tp: TablePartitionId,
    nodes: Vec<String>,
    policy: &CatchUpPolicy,
) -> bool {
    let mut waiting: BTreeSet<String> = nodes.into_iter().collect();
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let mut ready = Vec::new();
        for node in &waiting {
            let probe_result = tokio::time::timeout(
                policy.probe_timeout(),
                probe.has_data(node, tp.table_id, tp.partition_id),
            )
            .await;
            match probe_result {
                Ok(Ok(true)) => ready.push(node.clone()),
                Ok(Ok(false)) => debug!(%tp, node = %node, attempts, "node has not caught up"),
                Ok(Err(e)) => warn!(%tp, node = %node, attempts, error = %e, "has-data probe failed"),
                Err(_) => warn!(%tp, node = %node, attempts, "has-data probe timed out"),
            }
        }
        for node in ready {
            waiting.remove(&node);
        }
        if waiting.is_empty() {
            return true;
        }
        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            warn!(%tp, attempts, missing = ?waiting, "catch-up attempts exhausted, parking partition");
            return false;
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}
