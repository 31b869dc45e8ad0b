#![no_main]

use bedrock_wire::config::FrameConfig;
use bedrock_wire::core::frame::{FrameDecryptor, SecretMaterial};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let secret = SecretMaterial::new([0x42; 32], [0x24; 16]);
    let mut rx = FrameDecryptor::new(secret, &FrameConfig::default()).unwrap();

    // Arbitrary frames are rejected without panicking, and a rejection poisons
    if rx.decrypt(data.to_vec()).is_err() {
        assert!(rx.is_poisoned());
        assert!(rx.decrypt(data.to_vec()).is_err());
    }
});
