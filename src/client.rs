//! Per-client records and the adaptive quota estimator.

use std::collections::HashMap;

use crate::config::{ClientLimits, SchedParams};

/// How drastically the quota tracks the reported burst.
const UPDATE_RATE: f64 = 0.5;

/// State kept for one named client container.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    /// Quota handed out when no burst data is available, in ms.
    base_quota: f64,
    /// Lower bound for adaptive quotas, in ms.
    min_quota: f64,
    /// Upper bound for adaptive quotas, in ms. Set to the client's
    /// window-minimum share so one grant never exceeds it.
    max_quota: f64,
    /// Required share of the window (0..1).
    pub min_fraction: f64,
    /// Permitted share of the window (0..1).
    pub max_fraction: f64,
    /// SM percentage consumed while this client holds a token.
    pub sm_partition: u32,
    /// Memory limit in bytes.
    pub mem_limit: u64,
    /// Bytes currently accounted as allocated.
    pub mem_used: u64,
    /// Last computed quota, in ms.
    quota: f64,
    /// Last reported kernel burst estimate, in ms.
    burst: f64,
    /// Telemetry from the last completed grant.
    pub latest_overuse: f64,
    pub latest_actual_usage: f64,
}

impl ClientInfo {
    pub fn new(limits: &ClientLimits, params: &SchedParams) -> Self {
        Self {
            name: limits.name.clone(),
            base_quota: params.quota,
            min_quota: params.min_quota,
            max_quota: limits.min_fraction * params.window,
            min_fraction: limits.min_fraction,
            max_fraction: limits.max_fraction,
            sm_partition: limits.sm_partition,
            mem_limit: limits.mem_limit,
            mem_used: 0,
            quota: params.quota,
            burst: 0.0,
            latest_overuse: 0.0,
            latest_actual_usage: 0.0,
        }
    }

    pub fn set_burst(&mut self, estimated_burst: f64) {
        self.burst = estimated_burst;
    }

    /// Self-adaptive quota: an exponential moving average of the reported
    /// burst, clamped to `[min_quota, max_quota]`. Falls back to the static
    /// base quota while no burst data is available.
    pub fn next_quota(&mut self) -> f64 {
        if self.burst < 1e-9 {
            self.quota = self.base_quota;
            tracing::debug!(
                client = %self.name,
                quota_ms = self.quota,
                "no burst data, fallback to static quota"
            );
        } else {
            self.quota = self.burst * UPDATE_RATE + self.quota * (1.0 - UPDATE_RATE);
            self.quota = self.quota.max(self.min_quota);
            self.quota = self.quota.min(self.max_quota);
            tracing::debug!(
                client = %self.name,
                burst_ms = self.burst,
                quota_ms = self.quota,
                "assign adaptive quota"
            );
        }
        self.quota
    }

    /// Apply a memory accounting update and return the verdict.
    ///
    /// An allocation is permitted while it keeps `mem_used` within the limit;
    /// a free is permitted while it does not underflow the account.
    pub fn mem_update(&mut self, bytes: u64, is_allocate: bool) -> bool {
        if is_allocate {
            match self.mem_used.checked_add(bytes) {
                Some(next) if next <= self.mem_limit => {
                    self.mem_used = next;
                    true
                }
                _ => false,
            }
        } else if self.mem_used >= bytes {
            self.mem_used -= bytes;
            true
        } else {
            false
        }
    }
}

/// Mapping from client name to its record. Rebuilt entries come from the
/// resource-config file; the watcher applies reloads.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, ClientInfo>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ClientInfo> {
        self.clients.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ClientInfo> {
        self.clients.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Replace every listed entry with a fresh record. Existing entries not
    /// named in `limits` are left untouched, as are tokens and history.
    /// Replacement discards the previous record, so `mem_used` restarts at
    /// zero; a reload is a reconfiguration event.
    pub fn apply(&mut self, limits: &[ClientLimits], params: &SchedParams) {
        for entry in limits {
            let info = ClientInfo::new(entry, params);
            tracing::info!(
                client = %entry.name,
                request = entry.min_fraction,
                limit = entry.max_fraction,
                sm_partition = entry.sm_partition,
                mem_limit = entry.mem_limit,
                "registered client"
            );
            self.clients.insert(entry.name.clone(), info);
        }
    }
}
