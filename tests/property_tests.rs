//! Property-based tests using proptest
//!
//! Framing invariants over randomly generated actions, payloads, noise and
//! read boundaries.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use dualnet::core::codec::FrameCodec;
use dualnet::core::frame::{decode_batch, decode_stream, encode, START_SEQ};
use dualnet::protocol::dispatcher::first_occurrence;
use dualnet::protocol::message::Message;
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio_util::codec::Decoder;

fn action() -> impl Strategy<Value = String> {
    "[a-z_][a-z0-9_]{0,15}"
}

fn payload() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        ".*".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
            prop::collection::hash_map("[a-z]{1,6}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Bytes that can never form or complete a sentinel
fn noise() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>().prop_filter("no NUL", |b| *b != 0), 0..64)
}

// Property: decode(encode(action, payload)) preserves action and payload
proptest! {
    #[test]
    fn prop_frame_roundtrip(action in action(), payload in payload(), id in proptest::option::of("[a-z]{1,8}")) {
        let bytes = encode(&action, &payload, id.as_deref()).unwrap();
        let decoded = decode_batch(&bytes).unwrap();

        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0].action, &action);
        prop_assert_eq!(&decoded[0].payload, &payload);
        prop_assert_eq!(decoded[0].sender_id.as_deref(), id.as_deref());
    }
}

// Property: noise between two frames is skipped
proptest! {
    #[test]
    fn prop_resync_over_noise(
        first in action(), second in action(),
        a in payload(), b in payload(),
        lead in noise(), middle in noise(), tail in noise(),
    ) {
        let mut bytes = lead;
        bytes.extend_from_slice(&encode(&first, &a, None).unwrap());
        bytes.extend_from_slice(&middle);
        bytes.extend_from_slice(&encode(&second, &b, None).unwrap());
        bytes.extend_from_slice(&tail);

        let decoded = decode_batch(&bytes).unwrap();
        prop_assert_eq!(decoded.len(), 2);
        prop_assert_eq!(&decoded[0].action, &first);
        prop_assert_eq!(&decoded[0].payload, &a);
        prop_assert_eq!(&decoded[1].action, &second);
        prop_assert_eq!(&decoded[1].payload, &b);
    }
}

// Property: decoding is pure, so a second pass sees the same messages
proptest! {
    #[test]
    fn prop_decode_is_restartable(actions in prop::collection::vec(action(), 0..8)) {
        let mut bytes = Vec::new();
        for action in &actions {
            bytes.extend_from_slice(&encode(action, &json!(null), None).unwrap());
        }
        let snapshot = bytes.clone();

        let stream = decode_stream(&bytes);
        let first: Vec<_> = stream.clone().map(|m| m.unwrap().action).collect();
        let second: Vec<_> = stream.map(|m| m.unwrap().action).collect();

        prop_assert_eq!(&first, &actions);
        prop_assert_eq!(&second, &actions);
        prop_assert_eq!(bytes, snapshot);
    }
}

// Property: no frame is lost however the stream is cut into reads
proptest! {
    #[test]
    fn prop_codec_survives_arbitrary_read_boundaries(
        actions in prop::collection::vec(action(), 1..10),
        cuts in prop::collection::vec(1usize..48, 1..64),
    ) {
        let mut stream = Vec::new();
        for (i, action) in actions.iter().enumerate() {
            stream.extend_from_slice(&encode(action, &json!({"seq": i}), None).unwrap());
        }

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded: Vec<Message> = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();

        while offset < stream.len() {
            let step = (*cut.next().unwrap()).min(stream.len() - offset);
            buf.extend_from_slice(&stream[offset..offset + step]);
            offset += step;
            while let Some(batch) = codec.decode(&mut buf).unwrap() {
                decoded.extend(batch);
            }
        }

        prop_assert!(buf.is_empty());
        let seqs: Vec<Value> = decoded.iter().map(|m| m.payload["seq"].clone()).collect();
        let expected: Vec<Value> = (0..actions.len()).map(|i| json!(i)).collect();
        prop_assert_eq!(seqs, expected);
    }
}

// Property: a dangling start sentinel prefix is always retained
proptest! {
    #[test]
    fn prop_partial_start_sentinel_is_kept(noise in noise(), k in 1usize..5) {
        let mut bytes = noise;
        bytes.extend_from_slice(&START_SEQ[..k]);

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&bytes[..]);
        prop_assert!(codec.decode(&mut buf).unwrap().is_none());
        prop_assert_eq!(&buf[..], &START_SEQ[..k]);
    }
}

// Property: dedup keeps exactly one message per action, the first one
proptest! {
    #[test]
    fn prop_first_occurrence_keeps_first(actions in prop::collection::vec("[abc]", 0..20)) {
        let batch: Vec<Message> = actions
            .iter()
            .enumerate()
            .map(|(i, a)| Message::new(a.clone(), json!(i)))
            .collect();
        let (kept, dropped) = first_occurrence(batch);

        let mut seen = std::collections::HashSet::new();
        let expected: Vec<(String, Value)> = actions
            .iter()
            .enumerate()
            .filter(|(_, a)| seen.insert(a.to_string()))
            .map(|(i, a)| (a.clone(), json!(i)))
            .collect();

        prop_assert_eq!(dropped, actions.len() - expected.len());
        let kept: Vec<(String, Value)> = kept.into_iter().map(|m| (m.action, m.payload)).collect();
        prop_assert_eq!(kept, expected);
    }
}
