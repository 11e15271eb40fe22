#![no_main]

use dualnet::protocol::handshake::{parse_candidate, ClientHandshake};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Handshake payloads come straight off the wire
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    let _ = parse_candidate(payload.clone());

    let (mut client, _) = ClientHandshake::start("fuzz-client-0".into(), 4);
    let _ = client.on_confirm(payload);
    for round in 0..8 {
        if client.on_proposition(format!("fuzz-client-{round}")).is_err() {
            assert_eq!(client.attempts(), 4);
            break;
        }
    }
});
