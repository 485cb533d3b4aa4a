#![no_main]
use libfuzzer_sys::fuzz_target;
use nostr_core::RelayUrl;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Some(url) = RelayUrl::parse(s) {
            let _ = url.is_local();
            let _ = url.is_onion();
        }
    }
});
