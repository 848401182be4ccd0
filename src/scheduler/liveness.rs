use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracks which workers are alive, keyed by their self-reported IP.
///
/// Callbacks are always invoked after the internal lock is released, so a
/// callback may re-enter the tracker freely.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    bots: Mutex<HashMap<String, Instant>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat response from `ip`, refreshing its last-seen
    /// time. `on_new` fires only when the IP was not already tracked.
    pub fn add_ip<F>(&self, ip: &str, on_new: F)
    where
        F: FnOnce(&str),
    {
        let was_new = {
            let mut bots = self.lock();
            bots.insert(ip.to_string(), Instant::now()).is_none()
        };
        if was_new {
            tracing::info!(ip = %ip, "Worker connected");
            on_new(ip);
        }
    }

    /// Evict every worker not seen within `timeout`, invoking `on_evict`
    /// once per evicted IP. Safe to call repeatedly with the same timeout;
    /// a second sweep with no intervening heartbeats evicts nothing.
    pub fn cleanup<F>(&self, timeout: Duration, on_evict: F)
    where
        F: Fn(&str),
    {
        let evicted: Vec<String> = {
            let mut bots = self.lock();
            let expired: Vec<String> = bots
                .iter()
                .filter(|(_, last_seen)| last_seen.elapsed() > timeout)
                .map(|(ip, _)| ip.clone())
                .collect();
            for ip in &expired {
                bots.remove(ip);
            }
            expired
        };
        for ip in &evicted {
            tracing::warn!(ip = %ip, "Worker timed out");
            on_evict(ip);
        }
    }

    /// Snapshot of the currently-tracked IPs.
    pub fn connected_ips(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.bots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
