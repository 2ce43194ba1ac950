//! Credential Pool: tracks N upstream credentials, each with independent
//! RPM accounting, and answers "give me an eligible credential now" or
//! "none".
//!
//! `acquire` only selects — it never mutates the ring — so a single
//! pool-wide mutex held for the duration of selection is sufficient.
//! Atomicity between selection and use-recording comes from the
//! architectural invariant that the only caller is the single dispatcher
//! thread: a selecting-only `acquire` followed by an explicit `record_use`
//! call from that same thread is trivially race-free — see DESIGN.md.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Instant;
use crate::types::CredentialId;

const RPM_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CredentialState {
    id: CredentialId,
    usable: bool,
    timestamps: VecDeque<Instant>,
    last_invoked_at: Option<Instant>,
    capacity: usize,
}

impl CredentialState {
    fn new(id: CredentialId, rpm_per_key: u32) -> Self {
        Self {
            id,
            usable: true,
            timestamps: VecDeque::with_capacity(rpm_per_key as usize * 2),
            last_invoked_at: None,
            capacity: rpm_per_key as usize * 2,
        }
    }

    /// Retain only timestamps within the last 60s. Returns the pruned count.
    fn prune(&mut self, now: Instant) -> usize {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > RPM_WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.len()
    }

    fn record_use(&mut self, now: Instant) {
        if self.timestamps.len() == self.capacity {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);
        self.last_invoked_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialSnapshot {
    pub id: CredentialId,
    pub usable: bool,
    pub requests_last_minute: usize,
    pub available_capacity: i64,
    pub last_used: Option<Instant>,
    pub idle: Option<Duration>,
}

#[derive(Debug)]
pub struct CredentialPool {
    rpm_per_key: u32,
    states: Mutex<Vec<CredentialState>>,
}

impl CredentialPool {
    pub fn new(count: usize, rpm_per_key: u32) -> Self {
        let states = (0..count).map(|id| CredentialState::new(id, rpm_per_key)).collect();
        Self {
            rpm_per_key,
            states: Mutex::new(states),
        }
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eligibility rule: usable, under the RPM ceiling after
    /// pruning, and past the minimum-interval guard. Among eligible
    /// credentials, picks the greatest available capacity, breaking ties
    /// by larger idle time then lower id. Does not mutate any state — the
    /// caller must call `record_use` itself once it commits to using the
    /// returned credential.
    pub fn acquire(&self, now: Instant) -> Option<CredentialId> {
        let mut states = self.states.lock();
        let min_interval = Duration::from_secs_f64(60.0 / self.rpm_per_key as f64);

        let mut best: Option<(CredentialId, i64, Duration)> = None;
        for state in states.iter_mut() {
            if !state.usable {
                continue;
            }
            let used = state.prune(now) as i64;
            let available = self.rpm_per_key as i64 - used;
            if available <= 0 {
                continue;
            }
            let idle = match state.last_invoked_at {
                Some(last) => now.duration_since(last),
                None => Duration::MAX,
            };
            if state.last_invoked_at.is_some() && idle < min_interval {
                continue;
            }

            let better = match &best {
                None => true,
                Some((_, best_avail, best_idle)) => {
                    available > *best_avail
                        || (available == *best_avail && idle > *best_idle)
                        || (available == *best_avail && idle == *best_idle && state.id < best.as_ref().unwrap().0)
                }
            };
            if better {
                best = Some((state.id, available, idle));
            }
        }

        let chosen = best.map(|(id, ..)| id);
        if chosen.is_none() {
            debug!(target: "credential_pool", "no eligible credential at this tick");
        }
        chosen
    }

    /// Records a use against `id`. Must be called exactly once per actual
    /// upstream invocation on that credential (spec: "record_use is called
    /// iff a worker is actually launched"; the adapter retry state machine
    /// additionally calls this once per attempt beyond the first).
    pub fn record_use(&self, id: CredentialId, now: Instant) {
        let mut states = self.states.lock();
        if let Some(state) = states.iter_mut().find(|s| s.id == id) {
            state.record_use(now);
        }
    }

    /// Permanently flags a credential as having failed initialization. It
    /// will never be returned by `acquire` again.
    pub fn mark_unusable(&self, id: CredentialId) {
        let mut states = self.states.lock();
        if let Some(state) = states.iter_mut().find(|s| s.id == id) {
            state.usable = false;
            warn!(target: "credential_pool", credential = id, "marked unusable");
        }
    }

    pub fn all_unusable(&self) -> bool {
        self.states.lock().iter().all(|s| !s.usable)
    }

    pub fn snapshot(&self, now: Instant) -> Vec<CredentialSnapshot> {
        let mut states = self.states.lock();
        states
            .iter_mut()
            .map(|state| {
                let used = state.prune(now);
                CredentialSnapshot {
                    id: state.id,
                    usable: state.usable,
                    requests_last_minute: used,
                    available_capacity: self.rpm_per_key as i64 - used as i64,
                    last_used: state.last_invoked_at,
                    idle: state.last_invoked_at.map(|last| now.duration_since(last)),
                }
            })
            .collect()
    }
}
