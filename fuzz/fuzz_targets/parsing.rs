#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = unpickler::value_from_slice(data, Default::default());
    let _ = unpickler::parse_slice(data, None);
});
