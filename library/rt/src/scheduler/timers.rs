//! Receive-timeout timers.
//!
//! A single global deadline map serves every scheduler: `receive after T`
//! arms an entry, a successful match cancels it, and scheduler threads
//! fire whatever has expired on each trip around their loop. Precision
//! follows the scheduler wakeup cadence, which is all the soft-real-time
//! contract asks for.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::process::ProcessId;

struct TimerWheel {
    /// (deadline, token) → pid; the token disambiguates equal deadlines
    deadlines: Mutex<BTreeMap<(Instant, u64), ProcessId>>,
    index: Mutex<HashMap<u64, Instant>>,
}

lazy_static! {
    static ref WHEEL: TimerWheel = TimerWheel {
        deadlines: Mutex::new(BTreeMap::new()),
        index: Mutex::new(HashMap::new()),
    };
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Arms a timeout for `pid`, returning a token for cancellation.
pub fn arm(timeout: Duration, pid: ProcessId) -> u64 {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    let deadline = Instant::now() + timeout;
    WHEEL.deadlines.lock().insert((deadline, token), pid);
    WHEEL.index.lock().insert(token, deadline);
    token
}

/// Cancels a previously armed timeout; idempotent.
pub fn cancel(token: u64) {
    if let Some(deadline) = WHEEL.index.lock().remove(&token) {
        WHEEL.deadlines.lock().remove(&(deadline, token));
    }
}

/// Removes and returns every timer that has expired by `now`.
pub fn take_expired(now: Instant) -> Vec<(u64, ProcessId)> {
    let mut deadlines = WHEEL.deadlines.lock();
    let mut expired = Vec::new();
    while let Some((&(deadline, token), &pid)) = deadlines.iter().next() {
        if deadline > now {
            break;
        }
        deadlines.remove(&(deadline, token));
        expired.push((token, pid));
    }
    drop(deadlines);
    if !expired.is_empty() {
        let mut index = WHEEL.index.lock();
        for (token, _) in &expired {
            index.remove(token);
        }
    }
    expired
}

/// The soonest pending deadline, for idle-sleep bounding.
pub fn next_deadline() -> Option<Instant> {
    WHEEL.deadlines.lock().keys().next().map(|(deadline, _)| *deadline)
}
