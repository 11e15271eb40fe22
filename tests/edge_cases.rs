//! Framing edge cases at the codec boundary.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use dualnet::core::codec::FrameCodec;
use dualnet::core::frame::{decode_batch, encode, END_SEQ, START_SEQ};
use dualnet::ProtocolError;
use serde_json::{json, Value};
use tokio_util::codec::Decoder;

#[test]
fn test_wire_format_matches_reference_layout() {
    let bytes = encode("hello", &json!([1, 2, 3, 4, 5]), None).unwrap();
    assert_eq!(
        &bytes[..],
        b"\0+++\0{\"action\":\"hello\",\"data\":[1,2,3,4,5],\"_id\":null}\0---\0"
    );
}

#[test]
fn test_foreign_encoder_output_decodes() {
    // Key order and whitespace from another JSON encoder
    let bytes = b"\0+++\0{\"_id\": \"calm-lynx-1\", \"data\": {\"hp\": 3}, \"action\": \"hit\"}\0---\0";
    let msgs = decode_batch(bytes).unwrap();
    assert_eq!(msgs[0].action, "hit");
    assert_eq!(msgs[0].payload, json!({"hp": 3}));
    assert_eq!(msgs[0].sender_id.as_deref(), Some("calm-lynx-1"));
}

#[test]
fn test_empty_input_yields_nothing() {
    assert!(decode_batch(b"").unwrap().is_empty());
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_one_read_with_many_frames_is_one_batch() {
    let mut buf = BytesMut::new();
    for action in ["a", "b", "a"] {
        buf.extend_from_slice(&encode(action, &Value::Null, None).unwrap());
    }
    let mut codec = FrameCodec::default();
    let batch = codec.decode(&mut buf).unwrap().unwrap();
    let actions: Vec<_> = batch.iter().map(|m| m.action.as_str()).collect();
    assert_eq!(actions, ["a", "b", "a"]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_start_sentinel_split_across_reads() {
    let frame = encode("split", &1, None).unwrap();
    let mut codec = FrameCodec::default();

    let mut buf = BytesMut::from(&b"junk"[..]);
    buf.extend_from_slice(&frame[..2]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    assert_eq!(&buf[..], &START_SEQ[..2]);

    buf.extend_from_slice(&frame[2..]);
    let batch = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(batch[0].action, "split");
}

#[test]
fn test_end_sentinel_split_across_reads() {
    let frame = encode("split", &1, None).unwrap();
    let cut = frame.len() - END_SEQ.len() + 2;
    let mut codec = FrameCodec::default();

    let mut buf = BytesMut::from(&frame[..cut]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&frame[cut..]);
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 1);
}

#[test]
fn test_malformed_frame_fails_whole_read() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode("ok", &1, None).unwrap());
    buf.extend_from_slice(START_SEQ);
    buf.extend_from_slice(b"[1, 2");
    buf.extend_from_slice(END_SEQ);

    let mut codec = FrameCodec::default();
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ProtocolError::MalformedFrame { .. })
    ));
}

#[test]
fn test_body_without_action_is_malformed() {
    let mut bytes = START_SEQ.to_vec();
    bytes.extend_from_slice(br#"{"data": 1}"#);
    bytes.extend_from_slice(END_SEQ);
    assert!(matches!(
        decode_batch(&bytes),
        Err(ProtocolError::MalformedFrame { .. })
    ));
}

#[test]
fn test_unicode_payload_survives() {
    let bytes = encode("chat", &"héllo wörld 🎮", Some("jolly-panda-9")).unwrap();
    let msgs = decode_batch(&bytes).unwrap();
    assert_eq!(msgs[0].payload, json!("héllo wörld 🎮"));
}
