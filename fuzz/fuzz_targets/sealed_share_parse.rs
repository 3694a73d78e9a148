#![no_main]

use heirloom_core::crypto::SealedShare;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary stored blobs must parse to Ok or Err, never panic
    if let Ok(sealed) = SealedShare::from_bytes(data) {
        let bytes = sealed.to_bytes();
        assert!(SealedShare::from_bytes(&bytes).is_ok());
    }
});
