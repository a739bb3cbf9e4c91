//! Reconciler: a low-frequency sweep across every scaling group, independent
//! of any single scheduler tick's lock.
//!
//! Generalizes the accept-loop shutdown pattern from the IPC transport
//! (`CancellationToken` + `tokio::select!` against an `interval()` ticker)
//! to a periodic background job instead of a connection-accept loop. Covers
//! two concerns the per-tick Stage F does not: terminal-session retention
//! (purging rows once `terminal_retention` has elapsed) and a drift check
//! that re-derives each access_key's running-session count straight from the
//! registry, catching a scaling group whose own scheduler tick has stalled.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::model::SessionStatus;
use crate::registry::{ConcurrencyCounter, Registry};
use crate::types::{Result, ScalingGroupName};

pub struct Reconciler {
    registry: Arc<dyn Registry>,
    concurrency_counter: Arc<dyn ConcurrencyCounter>,
    clock: Arc<dyn Clock>,
    scaling_groups: Vec<ScalingGroupName>,
    sweep_interval: StdDuration,
    terminal_retention: chrono::Duration,
    cancel: CancellationToken,
}

/// Outcome of one sweep, surfaced for logging/tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub purged: u32,
    pub rescanned_access_keys: u32,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        concurrency_counter: Arc<dyn ConcurrencyCounter>,
        clock: Arc<dyn Clock>,
        scaling_groups: Vec<ScalingGroupName>,
        sweep_interval: StdDuration,
        terminal_retention: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            concurrency_counter,
            clock,
            scaling_groups,
            sweep_interval,
            terminal_retention,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the sweep loop, returning a handle the caller can `.abort()`
    /// or simply drop; call `shutdown()` for a cooperative stop instead.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    for scaling_group in &self.scaling_groups {
                        match self.sweep(scaling_group).await {
                            Ok(report) => debug!(%scaling_group, purged = report.purged, rescanned = report.rescanned_access_keys, "reconciler sweep complete"),
                            Err(err) => warn!(%scaling_group, error = %err, "reconciler sweep failed"),
                        }
                    }
                }
            }
        }
    }

    /// One sweep of a single scaling group: terminal retention then drift rescan.
    pub async fn sweep(&self, scaling_group: &ScalingGroupName) -> Result<SweepReport> {
        let purged = self.purge_expired_terminal_sessions(scaling_group).await?;
        let rescanned_access_keys = self.rescan_concurrency(scaling_group).await?;
        Ok(SweepReport { purged, rescanned_access_keys })
    }

    async fn purge_expired_terminal_sessions(&self, scaling_group: &ScalingGroupName) -> Result<u32> {
        let now = self.clock.now();
        let terminated = self.registry.terminated_sessions(scaling_group).await?;
        let mut purged = 0;
        for session in terminated {
            let Some(terminated_at) = session.terminated_at else {
                continue;
            };
            if now.signed_duration_since(terminated_at) > self.terminal_retention {
                self.registry.purge_session(&session.id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn rescan_concurrency(&self, scaling_group: &ScalingGroupName) -> Result<u32> {
        let active = self.registry.active_sessions(scaling_group).await?;
        let mut counted: std::collections::HashMap<crate::types::AccessKey, u32> =
            std::collections::HashMap::new();
        for session in active.iter().filter(|s| s.status == SessionStatus::Running) {
            *counted.entry(session.access_key.clone()).or_insert(0) += 1;
        }
        let count = counted.len() as u32;
        for (access_key, running) in counted {
            self.concurrency_counter.rescan(&access_key, running).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{SchedulingPriority, Session};
    use crate::registry::MemoryRegistry;
    use crate::resource::ResourceSlots;
    use crate::types::AccessKey;
    use chrono::Utc;

    struct NullCounter;

    #[async_trait::async_trait]
    impl ConcurrencyCounter for NullCounter {
        async fn increment(&self, _access_key: &AccessKey) -> Result<u32> {
            Ok(0)
        }
        async fn decrement(&self, _access_key: &AccessKey) -> Result<()> {
            Ok(())
        }
        async fn current(&self, _access_key: &AccessKey) -> Result<u32> {
            Ok(0)
        }
        async fn rescan(&self, _access_key: &AccessKey, _authoritative: u32) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn purges_terminal_sessions_past_retention() {
        let registry = Arc::new(MemoryRegistry::new());
        let sg = ScalingGroupName::from_string("default".into()).unwrap();
        let mut session = Session::new(
            AccessKey::from_string("ak1".into()).unwrap(),
            sg.clone(),
            ResourceSlots::new(),
            SchedulingPriority::default(),
        );
        session.status = SessionStatus::Terminated;
        session.terminated_at = Some(Utc::now() - chrono::Duration::hours(2));
        let session_id = session.id.clone();
        registry.insert_session(session).await.unwrap();

        let reconciler = Reconciler::new(
            registry.clone(),
            Arc::new(NullCounter),
            Arc::new(FixedClock(Utc::now())),
            vec![sg.clone()],
            StdDuration::from_secs(60),
            chrono::Duration::hours(1),
        );

        let report = reconciler.sweep(&sg).await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(registry.get_session(&session_id).await.is_err());
    }

    #[tokio::test]
    async fn keeps_terminal_sessions_within_retention() {
        let registry = Arc::new(MemoryRegistry::new());
        let sg = ScalingGroupName::from_string("default".into()).unwrap();
        let mut session = Session::new(
            AccessKey::from_string("ak1".into()).unwrap(),
            sg.clone(),
            ResourceSlots::new(),
            SchedulingPriority::default(),
        );
        session.status = SessionStatus::Cancelled;
        session.terminated_at = Some(Utc::now());
        let session_id = session.id.clone();
        registry.insert_session(session).await.unwrap();

        let reconciler = Reconciler::new(
            registry.clone(),
            Arc::new(NullCounter),
            Arc::new(FixedClock(Utc::now())),
            vec![sg.clone()],
            StdDuration::from_secs(60),
            chrono::Duration::hours(1),
        );

        let report = reconciler.sweep(&sg).await.unwrap();
        assert_eq!(report.purged, 0);
        assert!(registry.get_session(&session_id).await.is_ok());
    }
}
