//! Fuzz target for index settings parsing.
//!
//! Arbitrary JSON must either be rejected or produce settings whose
//! accessors and update planning never panic.

#![no_main]

use index_replication::settings::IndexSettings;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&[u8], &[u8])| {
    let (current, update) = data;
    let Ok(current) = serde_json::from_slice::<IndexSettings>(current) else {
        return;
    };

    let _ = current.validate();
    let _ = current.ops_batch_size();
    let _ = current.poll_interval();

    if let Ok(update) = serde_json::from_slice::<IndexSettings>(update) {
        let _ = current.plan_update(&update);
        let mut merged = current.clone();
        merged.merge(&update);
        assert!(merged.len() <= current.len() + update.len());
    }
});
