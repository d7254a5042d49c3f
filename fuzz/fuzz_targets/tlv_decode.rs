#![no_main]

use libfuzzer_sys::fuzz_target;
use loghouse_core::{decode_value, tlv_len};

fuzz_target!(|data: &[u8]| {
    // Walk a column buffer value by value.
    // Tests handling of:
    // - Unknown type tags
    // - Length prefixes running past the end of the buffer
    // - Truncated dictionary arrays

    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let Ok(len) = tlv_len(rest) else {
            let _ = decode_value(rest);
            break;
        };
        // A value with a valid length must decode without reading past it.
        if let Ok((_, _, consumed)) = decode_value(rest) {
            assert!(consumed <= rest.len());
        }
        offset += len;
    }
});
