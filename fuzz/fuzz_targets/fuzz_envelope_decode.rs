#![no_main]

use bedrock_wire::codec::ExtensionRegistry;
use bedrock_wire::protocol::Protocol;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

static PROTOCOL: OnceLock<Protocol> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let protocol = PROTOCOL.get_or_init(|| {
        Protocol::from_json(
            include_str!("../../tests/fixtures/protocol.json"),
            &ExtensionRegistry::default(),
        )
        .unwrap()
    });

    // Non-canonical input may re-encode differently but must decode to the same packet
    if let Ok((packet, _)) = protocol.decode_prefix(data) {
        if let Ok(again) = protocol.encode(&packet.name, &packet.params) {
            assert_eq!(protocol.decode(&again).unwrap(), packet);
        }
    }
});
