#![no_main]

use bedrock_wire::utils::compression::{compress, decompress};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(compressed) = compress(data, 7) {
        let out = decompress(&compressed, data.len().max(1)).unwrap();
        assert_eq!(out, data);
    }

    // Raw input must never inflate past the bound
    if let Ok(out) = decompress(data, 64 * 1024) {
        assert!(out.len() <= 64 * 1024);
    }
});
