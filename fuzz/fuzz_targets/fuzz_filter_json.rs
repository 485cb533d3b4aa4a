#![no_main]
use libfuzzer_sys::fuzz_target;
use nostr_core::Filter;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(filter) = serde_json::from_str::<Filter>(s) {
            let _ = filter.validate();
            let _ = filter.as_json();
        }
    }
});
