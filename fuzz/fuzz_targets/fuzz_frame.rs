#![no_main]

use bytes::BytesMut;
use dualnet::core::codec::FrameCodec;
use dualnet::core::frame::{decode_stream, encode};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Lazy decoding must terminate and never panic
    for msg in decode_stream(data).flatten() {
        // Anything that decodes must re-encode and decode to the same message
        if let Ok(bytes) = encode(&msg.action, &msg.payload, msg.sender_id.as_deref()) {
            let again: Vec<_> = decode_stream(&bytes).collect();
            assert_eq!(again.len(), 1);
        }
    }

    // The codec must agree with itself however the input is split
    let split = data.first().map(|b| *b as usize).unwrap_or(0) % (data.len() + 1);
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(&data[..split]);
    let _ = codec.decode(&mut buf);
    buf.extend_from_slice(&data[split..]);
    let _ = codec.decode(&mut buf);
});
