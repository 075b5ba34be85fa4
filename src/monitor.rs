use std::{collections::VecDeque, sync::Arc, time::Duration};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use service::now_ms;

/// Instances that have not beaconed for this long are swept.
const STALE_AFTER_MS: u64 = 5 * 60 * 1000;

/// Only the most recent alerts are kept.
const MAX_ALERTS: usize = 100;

/// A beacon from a peered server instance.
///
/// The hub is an inbox only; no consistency work happens across instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReport {
    pub instance_id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub peers: u64,
    #[serde(default)]
    pub sessions: u64,
    #[serde(default)]
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub at: u64,
    pub instance_id: String,
    pub message: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(flatten)]
    pub report: InstanceReport,
    pub last_seen: u64,
}

#[derive(Default)]
pub struct MonitorHub {
    instances: Mutex<AHashMap<String, Instance>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl MonitorHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn report(&self, report: InstanceReport) {
        let now = now_ms();

        {
            let mut alerts = self.alerts.lock();
            for message in &report.alerts {
                alerts.push_back(Alert {
                    at: now,
                    instance_id: report.instance_id.clone(),
                    message: message.clone(),
                });
            }

            while alerts.len() > MAX_ALERTS {
                alerts.pop_front();
            }
        }

        self.instances.lock().insert(
            report.instance_id.clone(),
            Instance {
                report,
                last_seen: now,
            },
        );
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.instances.lock().values().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn remove(&self, instance_id: &str) -> bool {
        self.instances.lock().remove(instance_id).is_some()
    }

    /// drop instances that stopped beaconing.
    pub fn sweep(&self) {
        let now = now_ms();
        self.instances
            .lock()
            .retain(|_, it| now.saturating_sub(it.last_seen) < STALE_AFTER_MS);
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let this = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match this.upgrade() {
                    Some(this) => this.sweep(),
                    None => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, alerts: Vec<String>) -> InstanceReport {
        InstanceReport {
            instance_id: id.to_string(),
            address: None,
            version: None,
            peers: 0,
            sessions: 0,
            alerts,
        }
    }

    #[test]
    fn beacons_upsert_instances() {
        let hub = MonitorHub::default();

        hub.report(report("a", Vec::new()));
        hub.report(report("a", Vec::new()));
        hub.report(report("b", Vec::new()));

        assert_eq!(hub.instances().len(), 2);
        assert!(hub.remove("a"));
        assert!(!hub.remove("a"));
    }

    #[test]
    fn alerts_are_trimmed_to_the_last_hundred() {
        let hub = MonitorHub::default();

        for i in 0..150 {
            hub.report(report("a", vec![format!("alert {i}")]));
        }

        let alerts = hub.alerts();
        assert_eq!(alerts.len(), 100);
        assert_eq!(alerts[0].message, "alert 50");
        assert_eq!(alerts[99].message, "alert 149");
    }
}
