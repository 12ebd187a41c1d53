//! Fault-injecting transport decorator.
//!
//! Wraps any `Transport` and applies a failure policy before forwarding:
//! partitioned targets are unreachable, messages drop with a configured
//! probability, and extra latency can be injected. A test-only
//! collaborator: the production binary never constructs one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

/// Mutable failure policy shared between a test and its transports.
#[derive(Debug, Default)]
struct Policy {
    /// Probability in [0, 1] that any message is dropped.
    drop_rate: f64,
    /// Latency added to every delivered message.
    extra_latency: Duration,
    /// Targets that are unreachable.
    partitioned: HashSet<u64>,
}

/// Handle for steering fault injection from a test.
#[derive(Clone, Default)]
pub struct ChaosPolicy {
    inner: Arc<Mutex<Policy>>,
}

impl ChaosPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the probability that a message is dropped.
    pub fn set_drop_rate(&self, rate: f64) {
        self.inner.lock().unwrap().drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Add latency to every delivered message.
    pub fn set_extra_latency(&self, latency: Duration) {
        self.inner.lock().unwrap().extra_latency = latency;
    }

    /// Make a target unreachable.
    pub fn partition(&self, node_id: u64) {
        self.inner.lock().unwrap().partitioned.insert(node_id);
    }

    /// Restore reachability of a target.
    pub fn heal(&self, node_id: u64) {
        self.inner.lock().unwrap().partitioned.remove(&node_id);
    }

    /// Clear all injected faults.
    pub fn heal_all(&self) {
        let mut policy = self.inner.lock().unwrap();
        policy.drop_rate = 0.0;
        policy.extra_latency = Duration::ZERO;
        policy.partitioned.clear();
    }

    /// Decide the fate of one message to `target`. Returns the latency to
    /// inject, or an error if the message never arrives.
    fn judge(&self, target: u64) -> Result<Duration, TransportError> {
        let policy = self.inner.lock().unwrap();
        if policy.partitioned.contains(&target) {
            return Err(TransportError::ConnectionFailed);
        }
        if policy.drop_rate > 0.0 && rand::rng().random_bool(policy.drop_rate) {
            return Err(TransportError::Timeout);
        }
        Ok(policy.extra_latency)
    }
}

/// Transport decorator applying a `ChaosPolicy` to every call.
pub struct ChaosTransport<T> {
    inner: T,
    policy: ChaosPolicy,
}

impl<T: Transport> ChaosTransport<T> {
    pub fn new(inner: T, policy: ChaosPolicy) -> Self {
        Self { inner, policy }
    }

    async fn gate(&self, target: u64) -> Result<(), TransportError> {
        let latency = self.policy.judge(target)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Transport for ChaosTransport<T> {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.gate(target).await?;
        self.inner.request_vote(target, args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.gate(target).await?;
        self.inner.append_entries(target, args).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.gate(target).await?;
        self.inner.install_snapshot(target, args).await
    }
}
