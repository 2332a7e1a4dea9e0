//! Fuzz harness for the mux frame decoder.
//!
//! Feeds arbitrary bytes to `FrameCodec`, which must never panic or
//! allocate past the payload limit. Every frame it accepts must survive an
//! encode/decode cycle unchanged.

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tether_net::mux::{FrameCodec, HEADER_LEN, MAX_PAYLOAD};
use tokio_util::codec::{Decoder, Encoder};

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec;
    let mut src = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut src) {
        let mut encoded = BytesMut::new();
        codec
            .encode(frame.clone(), &mut encoded)
            .expect("decoded frame must encode");
        assert!(encoded.len() <= HEADER_LEN + MAX_PAYLOAD);
        let again = codec
            .decode(&mut encoded)
            .expect("encoded frame must decode")
            .expect("encoded frame is complete");
        assert_eq!(again, frame);
        assert!(encoded.is_empty());
    }
});
