//! Shared scheduler state and the token lifecycle.
//!
//! Everything the request handlers, the config watcher, and the scheduler
//! daemon touch concurrently lives behind one mutex paired with a condition
//! variable: the candidate queue, the token set, the usage history, the SM
//! occupancy counter, and the client registry. `Condvar::wait_timeout` runs
//! on the monotonic clock, so timed waits are immune to wall-clock steps.

pub mod daemon;

use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::time::Duration;

use crate::client::ClientRegistry;
use crate::clock::Clock;
use crate::config::SchedParams;
use crate::history::UsageHistory;

/// Device-wide SM capacity: the partitions of all live tokens must fit here.
pub const SM_GLOBAL_LIMIT: u32 = 100;

/// A pending quota request awaiting selection.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Connection to reply on once a token is granted.
    pub stream: Arc<TcpStream>,
    pub name: String,
    pub req_id: u32,
    pub arrived_ms: f64,
}

/// An outstanding grant.
#[derive(Debug, Clone)]
pub struct Token {
    pub name: String,
    pub expiry_ms: f64,
    /// SM share charged at grant time; the refund uses this recorded value
    /// so occupancy stays balanced across config reloads.
    pub sm_partition: u32,
}

/// State guarded by the scheduler mutex.
#[derive(Debug, Default)]
pub struct SchedState {
    pub registry: ClientRegistry,
    pub history: UsageHistory,
    pub candidates: VecDeque<Candidate>,
    pub tokens: Vec<Token>,
    pub sm_occupied: u32,
}

impl SchedState {
    /// Remove tokens whose expiry has passed, refunding their SM share.
    /// Returns whether any token expired.
    pub fn expire_tokens(&mut self, now: f64) -> bool {
        let mut expired = false;
        let sm_occupied = &mut self.sm_occupied;
        self.tokens.retain(|token| {
            if token.expiry_ms <= now {
                tracing::debug!(client = %token.name, "token expired");
                *sm_occupied -= token.sm_partition;
                expired = true;
                false
            } else {
                true
            }
        });
        expired
    }

    /// Earliest expiry among live tokens.
    pub fn earliest_expiry(&self) -> Option<f64> {
        self.tokens
            .iter()
            .map(|t| t.expiry_ms)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Remove the client's live token if it holds one, refunding its SM
    /// share. Used when a client reappears before its grant ran out.
    pub fn remove_token_if_held(&mut self, name: &str) -> bool {
        match self.tokens.iter().position(|t| t.name == name) {
            Some(idx) => {
                let token = self.tokens.remove(idx);
                self.sm_occupied -= token.sm_partition;
                tracing::debug!(client = %name, "client returned early, token removed");
                true
            }
            None => false,
        }
    }

    /// Install a token for a freshly issued grant. A client holds at most one
    /// token, so any stale token for the same name is removed first.
    pub fn install_token(&mut self, name: &str, expiry_ms: f64, sm_partition: u32) {
        self.remove_token_if_held(name);
        self.tokens.push(Token {
            name: name.to_string(),
            expiry_ms,
            sm_partition,
        });
        self.sm_occupied += sm_partition;
    }
}

/// The shared scheduling context handed to every spawned task.
pub struct Scheduler {
    pub clock: Clock,
    pub params: SchedParams,
    state: Mutex<SchedState>,
    cond: Condvar,
}

impl Scheduler {
    pub fn new(clock: Clock, params: SchedParams, registry: ClientRegistry) -> Self {
        Self {
            clock,
            params,
            state: Mutex::new(SchedState {
                registry,
                ..SchedState::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler mutex poisoned")
    }

    /// Wake the scheduler daemon.
    pub fn notify(&self) {
        self.cond.notify_one();
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, SchedState>) -> MutexGuard<'a, SchedState> {
        self.cond
            .wait(guard)
            .expect("scheduler mutex poisoned")
    }

    /// Timed wait on the monotonic clock. Negative durations wait zero.
    pub fn wait_timeout_ms<'a>(
        &self,
        guard: MutexGuard<'a, SchedState>,
        timeout_ms: f64,
    ) -> (MutexGuard<'a, SchedState>, WaitTimeoutResult) {
        let timeout = Duration::from_secs_f64(timeout_ms.max(0.0) / 1e3);
        self.cond
            .wait_timeout(guard, timeout)
            .expect("scheduler mutex poisoned")
    }
}
