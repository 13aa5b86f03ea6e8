#![no_main]

use libfuzzer_sys::fuzz_target;
use ocinspect_engine::seclang::parser;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = parser::parse(text, "fuzz.conf");
    }
});
