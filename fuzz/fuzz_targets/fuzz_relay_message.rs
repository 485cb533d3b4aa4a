#![no_main]
use libfuzzer_sys::fuzz_target;
use nostr_core::{verify, RelayMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(RelayMessage::Event { event, .. }) = RelayMessage::from_json(s) {
            let _ = verify(&event);
            let _ = event.address();
            let _ = event.is_reply();
        }
    }
});
