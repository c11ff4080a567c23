//! Named per-spider clocks: countdown timers and daily alarms, usable
//! from rule callbacks. All clocks wake early when the table is dropped
//! so a stopping spider never sleeps through shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, TimeZone};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Time-of-day for alarm clocks.
#[derive(Debug, Clone, Copy)]
pub struct Bell {
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
}

#[derive(Clone)]
enum ClockKind {
    /// Sleep a fixed duration.
    Countdown(Duration),
    /// Sleep until the `occurrence`-th ring of `bell`, counting from now.
    Alarm { bell: Bell, occurrence: u32 },
}

pub struct TimerTable {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
}

struct State {
    clocks: HashMap<String, ClockKind>,
    closed: bool,
}

impl TimerTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    clocks: HashMap::new(),
                    closed: false,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Registers a clock. With no bell, `tol` is a countdown duration;
    /// with a bell, `occurrence` selects which daily ring to wait for.
    pub fn set(&self, id: &str, tol: Duration, bell: Option<Bell>) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            return false;
        }
        let kind = match bell {
            None => {
                if tol.is_zero() {
                    return false;
                }
                ClockKind::Countdown(tol)
            }
            Some(bell) => {
                if bell.hour > 23 || bell.min > 59 || bell.sec > 59 {
                    return false;
                }
                let occurrence = tol.as_secs().max(1) as u32;
                ClockKind::Alarm { bell, occurrence }
            }
        };
        state.clocks.insert(id.to_string(), kind);
        true
    }

    /// Blocks until the named clock fires. Returns whether the clock is
    /// still usable (false when unknown, or when the table closed during
    /// the sleep).
    pub fn sleep(&self, id: &str) -> bool {
        let kind = {
            let state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            match state.clocks.get(id) {
                Some(kind) => kind.clone(),
                None => return false,
            }
        };

        let duration = match kind {
            ClockKind::Countdown(d) => d,
            ClockKind::Alarm { bell, occurrence } => next_ring(bell, occurrence),
        };
        debug!(timer = id, ?duration, "timer sleeping");

        let mut state = self.inner.state.lock();
        let deadline = std::time::Instant::now() + duration;
        while !state.closed {
            if self
                .inner
                .wake
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        !state.closed && state.clocks.contains_key(id)
    }

    /// Cancels every clock and wakes all sleepers.
    pub fn drop_all(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.clocks.clear();
        self.inner.wake.notify_all();
    }
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Duration until the `occurrence`-th ring of `bell`, where a ring that
/// already passed today counts toward tomorrow.
fn next_ring(bell: Bell, occurrence: u32) -> Duration {
    let now = Local::now();
    let at = NaiveTime::from_hms_opt(bell.hour, bell.min, bell.sec)
        .unwrap_or(NaiveTime::MIN);
    let mut target = Local
        .from_local_datetime(&now.date_naive().and_time(at))
        .single()
        .unwrap_or(now);
    if target <= now {
        target += chrono::Duration::days(i64::from(occurrence));
    } else {
        target += chrono::Duration::days(i64::from(occurrence) - 1);
    }
    (target - now).to_std().unwrap_or(Duration::ZERO)
}
