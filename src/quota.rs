//! Quota governor - enforces per-minute and per-day request budgets
//!
//! Every completion attempt passes through here before touching the
//! backend. Budgets are tracked globally and per caller identity;
//! whichever is stricter wins, since the backend enforces a key-level
//! budget regardless of who is calling. Windows roll over lazily at
//! reservation time; there is no background timer, and granted slots are
//! never refunded.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex as Turnstile;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Error;
use crate::Result;

/// Free-tier defaults for the completion backend.
pub const DEFAULT_RPM_LIMIT: u32 = 60;
pub const DEFAULT_DAILY_LIMIT: u32 = 1500;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied { retry_after_ms: u64 },
}

/// Configured budget limits, applied to the global scope and to each
/// caller identity.
#[derive(Debug, Clone)]
pub struct QuotaLimits {
    pub rpm: u32,
    pub daily: u32,
    minute_period: Duration,
    day_period: Duration,
}

impl QuotaLimits {
    pub fn new(rpm: u32, daily: u32) -> Self {
        Self {
            rpm,
            daily,
            minute_period: MINUTE,
            day_period: DAY,
        }
    }

    #[cfg(test)]
    fn with_periods(mut self, minute: Duration, day: Duration) -> Self {
        self.minute_period = minute;
        self.day_period = day;
        self
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::new(DEFAULT_RPM_LIMIT, DEFAULT_DAILY_LIMIT)
    }
}

/// Point-in-time usage counts for the global scope.
#[derive(Debug, Clone, Copy)]
pub struct QuotaUsage {
    pub minute_used: u32,
    pub minute_limit: u32,
    pub day_used: u32,
    pub day_limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
    limit: u32,
    period: Duration,
}

impl Window {
    fn new(limit: u32, period: Duration, now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
            limit,
            period,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= self.period {
            self.started = now;
            self.count = 0;
        }
    }

    fn has_capacity(&self) -> bool {
        self.count < self.limit
    }

    fn retry_after_ms(&self, now: Instant) -> u64 {
        self.period
            .saturating_sub(now.duration_since(self.started))
            .as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowPair {
    minute: Window,
    day: Window,
}

impl WindowPair {
    fn new(limits: &QuotaLimits, now: Instant) -> Self {
        Self {
            minute: Window::new(limits.rpm, limits.minute_period, now),
            day: Window::new(limits.daily, limits.day_period, now),
        }
    }

    fn roll(&mut self, now: Instant) {
        self.minute.roll(now);
        self.day.roll(now);
    }
}

struct State {
    global: WindowPair,
    per_identity: HashMap<String, WindowPair>,
}

/// Tracks and enforces request budgets against the completion backend.
///
/// [`reserve`](Self::reserve) is the atomic check-and-increment;
/// [`acquire`](Self::acquire) is the waiting path, granting queued callers
/// strictly in arrival order.
pub struct QuotaGovernor {
    limits: QuotaLimits,
    state: Mutex<State>,
    turnstile: Turnstile<()>,
    max_wait: Duration,
}

impl QuotaGovernor {
    pub fn new(limits: QuotaLimits, max_wait: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(State {
                global: WindowPair::new(&limits, now),
                per_identity: HashMap::new(),
            }),
            limits,
            turnstile: Turnstile::new(()),
            max_wait,
        }
    }

    /// Try to reserve one request slot for `identity`.
    ///
    /// Grants only if the global and per-identity minute and day windows
    /// all have capacity; on grant every window is incremented inside the
    /// same critical section, so two racing callers can never both take
    /// the last slot. On denial the hint is the time until the blocking
    /// window resets; an exhausted day window outranks a minute window
    /// because it recovers slower.
    pub fn reserve(&self, identity: &str) -> Decision {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // An identity whose day window has lapsed is indistinguishable
        // from one never seen; drop it so caller-chosen identities cannot
        // grow the map without bound.
        state
            .per_identity
            .retain(|_, pair| now.duration_since(pair.day.started) < pair.day.period);

        let mut global = state.global;
        let mut caller = *state
            .per_identity
            .entry(identity.to_string())
            .or_insert_with(|| WindowPair::new(&self.limits, now));
        global.roll(now);
        caller.roll(now);

        let mut day_block: Option<u64> = None;
        let mut minute_block: Option<u64> = None;
        for window in [&global.day, &caller.day] {
            if !window.has_capacity() {
                let ms = window.retry_after_ms(now);
                day_block = Some(day_block.map_or(ms, |prev| prev.max(ms)));
            }
        }
        for window in [&global.minute, &caller.minute] {
            if !window.has_capacity() {
                let ms = window.retry_after_ms(now);
                minute_block = Some(minute_block.map_or(ms, |prev| prev.max(ms)));
            }
        }

        let decision = match day_block.or(minute_block) {
            Some(retry_after_ms) => Decision::Denied { retry_after_ms },
            None => {
                global.minute.count += 1;
                global.day.count += 1;
                caller.minute.count += 1;
                caller.day.count += 1;
                Decision::Granted
            }
        };

        state.global = global;
        state.per_identity.insert(identity.to_string(), caller);
        decision
    }

    /// Wait for a slot in strict arrival order.
    ///
    /// Waiters queue on a fair turnstile, so a caller that arrived first
    /// is granted first even when later callers retry faster. On denial
    /// the waiter sleeps out the retry hint and tries once more before
    /// giving up with [`Error::QuotaExceeded`]; a hint past the configured
    /// maximum wait fails immediately, since sleeping less than the hint
    /// cannot turn the denial into a grant.
    pub async fn acquire(&self, identity: &str) -> Result<()> {
        let _turn = self.turnstile.lock().await;

        match self.reserve(identity) {
            Decision::Granted => return Ok(()),
            Decision::Denied { retry_after_ms } => {
                let wait = Duration::from_millis(retry_after_ms);
                if wait > self.max_wait {
                    return Err(Error::QuotaExceeded { retry_after_ms });
                }
                debug!(identity, retry_after_ms, "quota window exhausted, waiting");
                tokio::time::sleep(wait).await;
            }
        }

        match self.reserve(identity) {
            Decision::Granted => Ok(()),
            Decision::Denied { retry_after_ms } => Err(Error::QuotaExceeded { retry_after_ms }),
        }
    }

    #[cfg(test)]
    fn tracked_identities(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .per_identity
            .len()
    }

    /// Snapshot of the global windows, for status surfaces and tests.
    pub fn usage(&self) -> QuotaUsage {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.global.roll(now);
        QuotaUsage {
            minute_used: state.global.minute.count,
            minute_limit: state.global.minute.limit,
            day_used: state.global.day.count,
            day_limit: state.global.day.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(rpm: u32, daily: u32) -> QuotaGovernor {
        QuotaGovernor::new(QuotaLimits::new(rpm, daily), Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixty_one_requests_in_one_second() {
        let gov = governor(60, 1500);
        for _ in 0..60 {
            assert_eq!(gov.reserve("session-1"), Decision::Granted);
        }
        match gov.reserve("session-1") {
            Decision::Denied { retry_after_ms } => {
                assert!(retry_after_ms > 0);
                assert!(retry_after_ms <= 60_000);
            }
            Decision::Granted => panic!("61st request must be denied"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_rolls_over() {
        let gov = governor(2, 1500);
        assert_eq!(gov.reserve("a"), Decision::Granted);
        assert_eq!(gov.reserve("a"), Decision::Granted);
        assert!(matches!(gov.reserve("a"), Decision::Denied { .. }));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(gov.reserve("a"), Decision::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_day_window_outranks_minute_window() {
        let gov = governor(1, 1);
        assert_eq!(gov.reserve("a"), Decision::Granted);
        match gov.reserve("a") {
            Decision::Denied { retry_after_ms } => {
                // Both windows are exhausted; the hint must come from the
                // day window, which is far longer than a minute.
                assert!(retry_after_ms > 60_000);
            }
            Decision::Granted => panic!("must be denied"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_budget_spans_identities() {
        let gov = governor(3, 1500);
        assert_eq!(gov.reserve("a"), Decision::Granted);
        assert_eq!(gov.reserve("b"), Decision::Granted);
        assert_eq!(gov.reserve("a"), Decision::Granted);
        // Fresh identity, but the global minute window is full.
        assert!(matches!(gov.reserve("c"), Decision::Denied { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_never_exceed_limits() {
        use rand::Rng;

        let limits = QuotaLimits::new(5, 12)
            .with_periods(Duration::from_secs(10), Duration::from_secs(60));
        let gov = QuotaGovernor::new(limits, Duration::from_secs(300));
        let mut rng = rand::thread_rng();

        for round in 0..200 {
            tokio::time::advance(Duration::from_millis(rng.gen_range(0..3000))).await;
            let identity = if round % 3 == 0 { "a" } else { "b" };
            let _ = gov.reserve(identity);
            let usage = gov.usage();
            assert!(usage.minute_used <= usage.minute_limit);
            assert!(usage.day_used <= usage.day_limit);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_grant_order_among_waiters() {
        let gov = Arc::new(governor(1, 1500));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only minute slot so every waiter has to queue.
        assert_eq!(gov.reserve("warm"), Decision::Granted);

        let mut handles = Vec::new();
        for id in 1..=3u32 {
            let gov = gov.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gov.acquire(&format!("waiter-{id}")).await.unwrap();
                order.lock().unwrap().push(id);
            }));
            // Let the spawned task reach the turnstile before the next one
            // is created, pinning arrival order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hint_beyond_max_wait_fails_without_sleeping() {
        // Day budget of one: after the first grant the retry hint is close
        // to a full day, far past the 10ms cap, so the second acquire gives
        // up on the spot instead of sleeping a wait that cannot help.
        let gov = QuotaGovernor::new(QuotaLimits::new(5, 1), Duration::from_millis(10));
        gov.acquire("a").await.unwrap();

        let before = Instant::now();
        match gov.acquire("a").await {
            Err(Error::QuotaExceeded { retry_after_ms }) => assert!(retry_after_ms > 60_000),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        // Paused clock: any sleep would have advanced time.
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_identities_are_pruned() {
        let limits = QuotaLimits::new(5, 12)
            .with_periods(Duration::from_secs(10), Duration::from_secs(60));
        let gov = QuotaGovernor::new(limits, Duration::from_secs(300));

        for i in 0..10 {
            let _ = gov.reserve(&format!("caller-{i}"));
        }
        assert_eq!(gov.tracked_identities(), 10);

        // One day period later every stale window is dropped on the next
        // reservation; only the fresh caller remains tracked.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(gov.reserve("caller-new"), Decision::Granted);
        assert_eq!(gov.tracked_identities(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_recovers_after_window_reset() {
        let gov = QuotaGovernor::new(QuotaLimits::new(1, 1500), Duration::from_secs(300));
        gov.acquire("a").await.unwrap();
        // Second acquire sleeps out the minute window and then succeeds.
        gov.acquire("a").await.unwrap();
        let usage = gov.usage();
        assert_eq!(usage.day_used, 2);
    }
}
