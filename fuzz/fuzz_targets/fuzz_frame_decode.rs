#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tictoc_net::core::codec::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode to frames or a clean error, never a panic
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(mut msg)) = codec.decode(&mut buf) {
        while msg.pop_int().is_ok() {}
    }
    let _ = codec.decode_eof(&mut buf);
});
