#![no_main]

use interlink::core::frame::Frame;
use interlink::protocol::message::WireMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Framing and message decoding must reject, never panic.
    if let Ok(frame) = Frame::from_bytes(data) {
        let _ = WireMessage::from_frame(&frame);
    }
});
