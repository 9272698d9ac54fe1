//! `BandwidthGovernor` (§4.6): token-bucket-style rate limiting,
//! independent per direction, plus the idle-state classification and
//! `WaitBW` deadline computation the `ReadinessLoop` uses to decide how
//! long it may safely block in the external readiness wait.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::collab::SelfStats;

/// Sentinel `WaitBW` returns when the caller's socket bookkeeping looks
/// stale and the outer loop should re-arm rather than trust the
/// computed deadline.
pub const REARM_SENTINEL: i64 = -100;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdleState {
    Idle,
    NotIdle,
    Polling,
}

/// `BandwidthLimited(last_time, last_size, limit, grace)` (§4.6).
///
/// `limit == 0` means unlimited. Otherwise projects the next moment at
/// which `last_size` bytes would have been "paid for" at `limit`
/// bytes/sec, shaved by `grace`, and compares it to `now`.
pub fn bandwidth_limited(last_time: Instant, last_size: u64, limit: u64, grace: Duration, now: Instant) -> bool {
    if limit == 0 {
        return false;
    }
    let next_time = last_time + Duration::from_secs_f64(last_size as f64 / limit as f64);
    let next_time = next_time.checked_sub(grace).unwrap_or(last_time);

    if next_time >= now + Duration::from_secs(1) {
        true
    } else {
        next_time > now
    }
}

pub struct BandwidthGovernor {
    pub up_limit: u64,
    pub down_limit: u64,
    pub late_ul_budget: Duration,
    pub late_dl_budget: Duration,
    up_wait: BwWaitQueue,
    down_wait: BwWaitQueue,
}

impl BandwidthGovernor {
    pub fn new(up_limit: u64, down_limit: u64) -> BandwidthGovernor {
        BandwidthGovernor {
            up_limit,
            down_limit,
            late_ul_budget: Duration::ZERO,
            late_dl_budget: Duration::ZERO,
            up_wait: BwWaitQueue::new(),
            down_wait: BwWaitQueue::new(),
        }
    }

    /// Pull the per-direction late budgets (`Self.LateUL()`/`Self.LateDL()`)
    /// from the `SelfStats` collaborator. Must be called at least once
    /// before the grace-dependent methods below are trusted; the
    /// constructor seeds both budgets to zero rather than guessing.
    pub fn sync_late_budgets(&mut self, stats: &dyn SelfStats) {
        self.late_ul_budget = stats.late_ul_budget();
        self.late_dl_budget = stats.late_dl_budget();
    }

    pub fn up_limited(&self, last_time: Instant, last_size: u64, now: Instant) -> bool {
        bandwidth_limited(last_time, last_size, self.up_limit, self.late_ul_budget, now)
    }

    pub fn down_limited(&self, last_time: Instant, last_size: u64, now: Instant) -> bool {
        bandwidth_limited(last_time, last_size, self.down_limit, self.late_dl_budget, now)
    }

    /// `IdleState` (§4.6). `IsIdle` (not modeled separately here) is
    /// simply `idle_state(..) == Idle && !disk_active`, left to the
    /// caller since disk activity is a `Content` collaborator concern.
    pub fn idle_state(
        &self,
        up_last_time: Instant,
        up_last_size: u64,
        down_last_time: Instant,
        down_last_size: u64,
        now: Instant,
    ) -> IdleState {
        let up_next = project_next(up_last_time, up_last_size, self.up_limit);
        let down_next = project_next(down_last_time, down_last_size, self.down_limit);

        let up_beyond_late = up_next.map(|t| t > now + self.late_ul_budget).unwrap_or(false);
        let down_beyond_late = down_next.map(|t| t > now + self.late_dl_budget).unwrap_or(false);
        let up_limited_now = up_next.map(|t| t > now).unwrap_or(false);
        let down_limited_now = down_next.map(|t| t > now).unwrap_or(false);

        if up_beyond_late && down_beyond_late {
            IdleState::Idle
        } else if (up_limited_now && !up_beyond_late) != (down_limited_now && !down_beyond_late) {
            // exactly one direction limited now but not beyond the late window
            IdleState::NotIdle
        } else {
            IdleState::Polling
        }
    }

    /// `WaitBW` (§4.6): deadline before bandwidth becomes available for
    /// either direction, plus per-direction "ontime" flags. Returns
    /// `(deadline, up_ontime, down_ontime)`, or `None` with the
    /// `REARM_SENTINEL` semantics documented on the constant when the
    /// bookkeeping looks stale.
    ///
    /// `up_was_limited`/`down_was_limited` are the cached "currently
    /// limited" flags from the same tick's `IntervalCheck`
    /// (`m_f_limitu`/`m_f_limitd` in the original) -- the staleness check
    /// below is gated on those, not on whether a cap happens to be
    /// configured, since an unsaturated capped peer must still be able to
    /// rearm normally.
    pub fn wait_bw(
        &self,
        up_last_time: Instant,
        up_last_size: u64,
        down_last_time: Instant,
        down_last_size: u64,
        now: Instant,
        up_was_limited: bool,
        down_was_limited: bool,
    ) -> Option<(Duration, bool, bool)> {
        let up_next = project_next(up_last_time, up_last_size, self.up_limit);
        let down_next = project_next(down_last_time, down_last_size, self.down_limit);

        let up_stale = up_next.map(|t| t <= now + self.late_ul_budget).unwrap_or(false) && up_was_limited;
        let down_stale = down_next.map(|t| t <= now + self.late_dl_budget).unwrap_or(false) && down_was_limited;
        if up_stale || down_stale {
            return None;
        }

        let up_deadline = up_next.map(|t| t.saturating_duration_since(now + self.late_ul_budget));
        let down_deadline = down_next.map(|t| t.saturating_duration_since(now + self.late_dl_budget));

        let deadline = match (up_deadline, down_deadline) {
            (Some(u), Some(d)) => u.min(d),
            (Some(u), None) => u,
            (None, Some(d)) => d,
            (None, None) => Duration::ZERO,
        };

        let up_ontime = up_next.map(|t| t <= now).unwrap_or(true);
        let down_ontime = down_next.map(|t| t <= now).unwrap_or(true);

        Some((deadline, up_ontime, down_ontime))
    }

    pub fn up_queue(&mut self) -> &mut BwWaitQueue {
        &mut self.up_wait
    }

    pub fn down_queue(&mut self) -> &mut BwWaitQueue {
        &mut self.down_wait
    }
}

fn project_next(last_time: Instant, last_size: u64, limit: u64) -> Option<Instant> {
    if limit == 0 {
        None
    } else {
        Some(last_time + Duration::from_secs_f64(last_size as f64 / limit as f64))
    }
}

/// One of the two FIFO queues (§4.8) holding peers deferred by a
/// direction's bandwidth limit, giving each a fair next turn.
#[derive(Default)]
pub struct BwWaitQueue {
    order: VecDeque<SocketAddr>,
}

impl BwWaitQueue {
    pub fn new() -> BwWaitQueue {
        BwWaitQueue::default()
    }

    pub fn enqueue(&mut self, addr: SocketAddr) {
        if !self.order.contains(&addr) {
            self.order.push_back(addr);
        }
    }

    pub fn requeue(&mut self, addr: SocketAddr) {
        self.dequeue(addr);
        self.order.push_back(addr);
    }

    pub fn dequeue(&mut self, addr: SocketAddr) {
        if let Some(pos) = self.order.iter().position(|a| *a == addr) {
            self.order.remove(pos);
        }
    }

    pub fn pop_front(&mut self) -> Option<SocketAddr> {
        self.order.pop_front()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_limited() {
        let now = Instant::now();
        assert!(!bandwidth_limited(now, 1_000_000, 0, Duration::ZERO, now));
    }

    #[test]
    fn limited_when_projection_beyond_a_second() {
        let now = Instant::now();
        let last_time = now;
        // 10 MB at 1 B/s is far in the future.
        assert!(bandwidth_limited(last_time, 10_000_000, 1, Duration::ZERO, now));
    }

    #[test]
    fn wait_bw_ignores_staleness_when_not_flagged_as_limited() {
        let mut gov = BandwidthGovernor::new(100, 0);
        gov.late_ul_budget = Duration::from_millis(250);
        let now = Instant::now();
        let last_time = now - Duration::from_secs(10);
        // projection looks stale (long past), but this tick's IntervalCheck
        // never flagged upload as currently limited -- must not force a rearm.
        let result = gov.wait_bw(last_time, 1, now, 0, now, false, false);
        assert!(result.is_some());
    }

    #[test]
    fn wait_bw_rearms_when_flagged_as_limited_and_stale() {
        let mut gov = BandwidthGovernor::new(100, 0);
        gov.late_ul_budget = Duration::from_millis(250);
        let now = Instant::now();
        let last_time = now - Duration::from_secs(10);
        let result = gov.wait_bw(last_time, 1, now, 0, now, true, false);
        assert!(result.is_none());
    }

    #[test]
    fn wait_queue_enqueue_is_idempotent() {
        let mut q = BwWaitQueue::new();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        q.enqueue(a);
        q.enqueue(a);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn wait_queue_requeue_moves_to_tail() {
        let mut q = BwWaitQueue::new();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        q.enqueue(a);
        q.enqueue(b);
        q.requeue(a);
        assert_eq!(q.pop_front(), Some(b));
        assert_eq!(q.pop_front(), Some(a));
    }
}
