#![no_main]

use interlink::core::frame::{Frame, FrameKind};
use interlink::core::serialization::SerializationFormat;
use interlink::protocol::registry::Registry;
use interlink::protocol::signing::EnvelopeSigner;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // First byte picks the body format; the rest is the body.
    let format = if data[0] % 2 == 0 {
        SerializationFormat::Json
    } else {
        SerializationFormat::MessagePack
    };
    let Ok(bytes) = Frame::new(FrameKind::Envelope, format, data[1..].to_vec()).to_bytes() else {
        return;
    };

    let registry = Registry::with_format(format);
    let _ = registry.register_with(
        "fuzz",
        |v: &serde_json::Value| Ok(v.clone()),
        |_v: serde_json::Value, _o| async { Ok::<_, String>(()) },
    );

    if let Ok(envelope) = registry.decode(&bytes) {
        if let Ok(signer) = EnvelopeSigner::new("fuzz-secret") {
            let _ = signer.verify(&envelope);
        }
        let _ = registry.encode(&envelope);
    }
});
