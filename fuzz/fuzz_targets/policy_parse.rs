#![no_main]

use heirloom_inherit::UnlockPolicy;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(policy) = toml::from_str::<UnlockPolicy>(text) {
        // Validation must reject without panicking, and accepted policies
        // must yield usable durations
        if policy.validate().is_ok() {
            let _ = policy.check_in_interval();
            let _ = policy.grace_period();
            let _ = policy.quorum_window();
            let _ = policy.escalation_threshold();
        }
    }
});
