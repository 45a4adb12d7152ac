//! Reclamation sweep.
//!
//! Terminates running instances that are past their expiry or idle beyond
//! the configured threshold, notices containers that died underneath a
//! running instance, and drops terminal records once their retention window
//! has passed.

use super::Orchestrator;
use crate::instance::{InstanceId, InstanceState, Termination};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub expired: Vec<InstanceId>,
    pub idle: Vec<InstanceId>,
    /// Running instances whose container was found dead
    pub died: Vec<InstanceId>,
    /// Stops that were never acknowledged
    pub forced: Vec<InstanceId>,
    pub purged: Vec<InstanceId>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty()
            && self.idle.is_empty()
            && self.died.is_empty()
            && self.forced.is_empty()
            && self.purged.is_empty()
    }

    /// Instances taken out of service by this sweep.
    pub fn reclaimed(&self) -> usize {
        self.expired.len() + self.idle.len() + self.died.len()
    }
}

enum Reason {
    Expired,
    Idle,
}

impl Orchestrator {
    /// Run one reclamation pass as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        for instance in self.list().await {
            if instance.state != InstanceState::Running {
                continue;
            }
            let id = instance.instance_id;

            let reason = if instance.is_expired(now) {
                Some(Reason::Expired)
            } else if self
                .config
                .idle_timeout
                .is_some_and(|idle| instance.idle_for(now) >= idle)
            {
                Some(Reason::Idle)
            } else {
                None
            };

            let Some(reason) = reason else {
                match self.manager.observe(id).await {
                    Ok(InstanceState::Failed) => report.died.push(id),
                    Ok(_) => {}
                    Err(e) => debug!("Skipping instance {}: {}", id, e),
                }
                continue;
            };

            match self.terminate(id).await {
                Ok(termination) => {
                    if let Termination::Forced { .. } = termination {
                        report.forced.push(id);
                    }
                    match reason {
                        Reason::Expired => {
                            info!("Reclaimed expired instance {}", id);
                            report.expired.push(id);
                        }
                        Reason::Idle => {
                            info!("Reclaimed idle instance {}", id);
                            report.idle.push(id);
                        }
                    }
                }
                Err(e) => warn!("Failed to reclaim instance {}: {}", id, e),
            }
        }

        report.purged = self
            .manager
            .purge_terminal(now - self.config.terminal_retention)
            .await;
        self.forget(&report.purged);

        report
    }

    /// Run [`sweep_once`](Self::sweep_once) every `interval` until `cancel`
    /// fires.
    pub fn spawn_reclaimer(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Reclaimer started (every {:?})", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep_once(Utc::now()).await;
                        if !report.is_empty() {
                            info!(
                                "Sweep reclaimed {} instance(s), purged {} record(s)",
                                report.reclaimed(),
                                report.purged.len()
                            );
                        }
                    }
                }
            }

            info!("Reclaimer stopped");
        })
    }
}
