// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz the envelope JSON decoder with arbitrary bytes.
//!
//! Unlike fuzz_envelope_deser which only tests valid UTF-8, this target
//! feeds raw bytes through the decoder to ensure no panics on malformed
//! input, including invalid UTF-8.
#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _: Result<asap_core::Envelope, _> = serde_json::from_slice(data);

    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<asap_core::Envelope, _> = serde_json::from_str(s);
        let _ = asap_core::negotiate_version(s, asap_core::ASAP_VERSION);
    }
});
