use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default time a nonce is remembered.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(10);

/// Sliding time window of recently seen nonces.
///
/// Entries are kept in arrival order, so expiry is a prefix trim. Memory is
/// bounded by the number of nonces registered within one TTL.
#[derive(Debug)]
pub struct NonceWindow {
    ttl: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug, Default)]
struct WindowState {
    set: HashSet<Vec<u8>>,
    order: VecDeque<(Instant, Vec<u8>)>,
}

impl NonceWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register `nonce` and report whether it was already in the window.
    pub fn seen(&self, nonce: &[u8]) -> bool {
        self.seen_at(nonce, Instant::now())
    }

    /// [`seen`](Self::seen) with an explicit clock. `now` must not go backwards
    /// between calls.
    pub fn seen_at(&self, nonce: &[u8], now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(cutoff) = now.checked_sub(self.ttl) {
            while state.order.front().is_some_and(|(at, _)| *at <= cutoff) {
                if let Some((_, expired)) = state.order.pop_front() {
                    state.set.remove(&expired);
                }
            }
        }

        if state.set.contains(nonce) {
            return true;
        }
        state.set.insert(nonce.to_vec());
        state.order.push_back((now, nonce.to_vec()));
        false
    }

    /// Number of nonces currently remembered.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_TTL)
    }
}
