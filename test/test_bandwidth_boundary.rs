//! Boundary properties from the testable-properties list: unlimited
//! bandwidth never reports limited, and the no-upload-cap interval
//! policy pins to the documented constants.

use std::time::{Duration, Instant};

use bip_swarm::bandwidth::bandwidth_limited;
use bip_swarm::ChokeScheduler;

#[test]
fn bandwidth_limited_is_always_false_at_zero_limit() {
    let now = Instant::now();
    assert!(!bandwidth_limited(now, u64::MAX, 0, Duration::ZERO, now));
}

#[test]
fn no_upload_cap_pins_min_unchoke_and_interval_constants() {
    let mut sched = ChokeScheduler::new(10);
    sched.set_unchoke_intervals(false, 0, 16384);
    assert_eq!(sched.max_unchoke(), 10, "max_unchoke is caller-owned sizing, not reset by interval policy");
    assert_eq!(sched.unchoke_interval, Duration::from_secs(10));
    assert_eq!(sched.opt_interval, Duration::from_secs(30));
}

#[test]
fn adapting_down_never_passes_the_floor() {
    let mut sched = ChokeScheduler::new(3);
    for _ in 0..5 {
        sched.note_deferred_upload();
        sched.note_deferred_upload();
        sched.adapt_max_unchoke(3);
    }
    assert!(sched.max_unchoke() >= 3);
}
