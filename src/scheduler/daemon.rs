//! The scheduler daemon: one long-running loop that selects candidates,
//! issues tokens, and sleeps until the earliest expiry or a new arrival.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::MutexGuard;

#[cfg(feature = "random-quota")]
use rand::Rng;

use super::{Candidate, SchedState, Scheduler, SM_GLOBAL_LIMIT};
use crate::handler::send_with_retry;
use crate::protocol::{self, Response};

/// Upper bound on the sleep while every queued candidate is over its ceiling.
const CEILING_WAIT_MS: f64 = 2000.0;

/// A queued candidate annotated with its fairness measures for one round.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    /// Position in the candidate queue.
    idx: usize,
    /// Shortfall against the required minimum share; positive = under-served.
    missing: f64,
    /// Headroom below the permitted ceiling; positive = admissible.
    remaining: f64,
    arrived_ms: f64,
    sm_partition: u32,
}

/// Selection priority: under-served candidates first, most starved leading;
/// among candidates that met their minimum, the one furthest below its
/// ceiling leads. Ties go to the earlier arrival.
fn priority(a: &Scored, b: &Scored) -> Ordering {
    match (a.missing > 0.0, b.missing > 0.0) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => b
            .missing
            .total_cmp(&a.missing)
            .then(a.arrived_ms.total_cmp(&b.arrived_ms)),
        (false, false) => b
            .remaining
            .total_cmp(&a.remaining)
            .then(a.arrived_ms.total_cmp(&b.arrived_ms)),
    }
}

/// Admit candidates in priority order while their combined SM partitions fit
/// into the remaining device capacity.
fn pack_by_capacity(sorted: &[Scored], sm_occupied: u32) -> Vec<Scored> {
    let mut admitted = Vec::new();
    let mut planned = sm_occupied;
    for cand in sorted {
        if planned + cand.sm_partition <= SM_GLOBAL_LIMIT {
            admitted.push(*cand);
            planned += cand.sm_partition;
        }
    }
    admitted
}

/// Pick the next batch of candidates to grant. Loops internally, sleeping on
/// the condition variable when nothing is admissible, until at least one
/// candidate survives both the window-usage check and the SM packing pass.
fn select_candidates<'a>(
    sched: &'a Scheduler,
    mut state: MutexGuard<'a, SchedState>,
) -> (MutexGuard<'a, SchedState>, Vec<Candidate>) {
    loop {
        let now = sched.clock.now_ms();
        // tokens may have run out during an internal sleep; refund them so
        // the packing pass sees the real occupancy
        state.expire_tokens(now);

        let window = sched.params.window.min(now);
        let window_start = now - window;

        state.history.prune(now - sched.params.window);
        let usage = state.history.usage_since(window_start);
        if tracing::enabled!(tracing::Level::TRACE) {
            for entry in state.history.iter() {
                tracing::trace!(
                    container = %entry.name,
                    start_s = entry.start / 1e3,
                    end_s = entry.end / 1e3,
                    "window entry"
                );
            }
        }

        let mut valid = Vec::new();
        let mut ceiling_wait = CEILING_WAIT_MS;
        for (idx, cand) in state.candidates.iter().enumerate() {
            let Some(client) = state.registry.get(&cand.name) else {
                continue;
            };
            let used = usage.get(&cand.name).copied().unwrap_or(0.0);
            let limit = client.max_fraction * window;
            let require = client.min_fraction * window;
            if limit - used > 0.0 {
                valid.push(Scored {
                    idx,
                    missing: require - used,
                    remaining: limit - used,
                    arrived_ms: cand.arrived_ms,
                    sm_partition: client.sm_partition,
                });
            } else {
                ceiling_wait = ceiling_wait.min(used - limit);
            }
        }
        tracing::debug!(valid = valid.len(), queued = state.candidates.len(), "selection round");

        if valid.is_empty() {
            // every queued candidate is at its usage ceiling; sleep until the
            // closest one can drop back under it, or a new request arrives
            tracing::debug!(sleep_ms = ceiling_wait, "all candidates over limit");
            state = sched.wait_timeout_ms(state, ceiling_wait).0;
            continue;
        }

        valid.sort_by(priority);
        let admitted = pack_by_capacity(&valid, state.sm_occupied);

        if admitted.is_empty() {
            // every admissible candidate would overflow SM capacity; sleep
            // until the oldest history entry leaves the window
            let wait_ms = state
                .history
                .earliest_end()
                .map(|end| end - (now - sched.params.window))
                .unwrap_or(CEILING_WAIT_MS);
            tracing::debug!(sleep_ms = wait_ms, "no candidate fits SM capacity");
            state = sched.wait_timeout_ms(state, wait_ms).0;
            continue;
        }

        let chosen: HashSet<usize> = admitted.iter().map(|s| s.idx).collect();
        let mut picked: HashMap<usize, Candidate> = HashMap::new();
        let mut rest = std::collections::VecDeque::new();
        for (idx, cand) in state.candidates.drain(..).enumerate() {
            if chosen.contains(&idx) {
                picked.insert(idx, cand);
            } else {
                rest.push_back(cand);
            }
        }
        state.candidates = rest;

        let selected = admitted
            .iter()
            .map(|s| picked.remove(&s.idx).expect("admitted candidate"))
            .collect();
        return (state, selected);
    }
}

/// Run the scheduler daemon forever.
pub fn run(sched: &Scheduler) {
    #[cfg(feature = "random-quota")]
    let mut rng = rand::thread_rng();

    loop {
        let mut state = sched.lock();
        if state.candidates.is_empty() {
            drop(sched.wait(state));
            continue;
        }

        state.expire_tokens(sched.clock.now_ms());

        let (mut state, selected) = select_candidates(sched, state);

        // issue grants: record history, install tokens, then reply off-lock
        let mut replies = Vec::with_capacity(selected.len());
        for cand in selected {
            let now = sched.clock.now_ms();
            let Some(client) = state.registry.get_mut(&cand.name) else {
                tracing::warn!(client = %cand.name, "selected client vanished, dropping grant");
                continue;
            };
            #[allow(unused_mut)]
            let mut quota = client.next_quota();
            #[cfg(feature = "random-quota")]
            {
                quota *= rng.gen_range(0.4..1.0);
            }
            let sm_partition = client.sm_partition;

            tracing::debug!(
                client = %cand.name,
                quota_ms = quota,
                waited_ms = now - cand.arrived_ms,
                "grant issued"
            );

            state.history.record(&cand.name, now, quota);
            state.install_token(&cand.name, now + quota, sm_partition);
            replies.push((cand.stream, cand.req_id, quota, cand.name));
        }
        tracing::debug!(tokens = state.tokens.len(), sm_occupied = state.sm_occupied, "tokens updated");
        drop(state);

        for (stream, req_id, quota, name) in replies {
            let frame = protocol::encode_response(req_id, &Response::Quota { quota });
            if let Err(err) = send_with_retry(&stream, &frame) {
                tracing::error!(client = %name, %err, "failed to deliver quota reply");
            }
        }

        // wait until the earliest token expires or an actionable request
        // arrives: an early return, or one that fits the spare SM capacity
        let mut state = sched.lock();
        loop {
            let now = sched.clock.now_ms();
            if state.expire_tokens(now) {
                break;
            }
            let Some(earliest) = state.earliest_expiry() else {
                break;
            };

            let (guard, timeout) = sched.wait_timeout_ms(state, earliest - now);
            state = guard;

            if timeout.timed_out() {
                state.expire_tokens(sched.clock.now_ms());
                break;
            }

            let arrivals: Vec<String> = state.candidates.iter().map(|c| c.name.clone()).collect();
            let mut reschedule = false;
            for name in &arrivals {
                if state.remove_token_if_held(name) {
                    reschedule = true;
                    break;
                }
                let partition = state
                    .registry
                    .get(name)
                    .map(|c| c.sm_partition)
                    .unwrap_or(0);
                if state.sm_occupied + partition <= SM_GLOBAL_LIMIT {
                    reschedule = true;
                    break;
                }
            }
            if reschedule {
                break;
            }
        }
        drop(state);
    }
}
