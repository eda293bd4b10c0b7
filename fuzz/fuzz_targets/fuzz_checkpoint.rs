//! Fuzz target for checkpoint arithmetic.
//!
//! Lag and advance checks must never panic or overflow, whatever the
//! sequence numbers.

#![no_main]

use index_replication::checkpoint::Checkpoint;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (i64, i64, i64, i64, i64)| {
    let (leader, follower, next_leader, next_follower, tip) = data;
    let current = Checkpoint::new(leader, follower);
    let next = Checkpoint::new(next_leader, next_follower);

    let _ = current.lag(tip);

    // Advancing to itself is always allowed
    assert!(current.allows_advance_to(&current));
    if current.allows_advance_to(&next) && next.allows_advance_to(&current) {
        assert_eq!(current, next);
    }
});
