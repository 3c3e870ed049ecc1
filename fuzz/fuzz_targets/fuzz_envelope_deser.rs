// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz envelope deserialization and validation with arbitrary bytes.
//!
//! Tests that `Envelope` deserialization never panics on any input,
//! including truncated JSON and adversarial payloads, and that a
//! successfully decoded envelope survives an encode -> decode round-trip
//! and never panics under `validate_envelope`.
#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let direct: Result<asap_core::Envelope, _> = serde_json::from_slice(data);

    if let Ok(envelope) = &direct {
        if let Ok(json) = serde_json::to_string(envelope) {
            let rt: Result<asap_core::Envelope, _> = serde_json::from_str(&json);
            assert!(rt.is_ok(), "round-trip decode must succeed");
        }
        let _ = asap_core::validate_envelope(envelope);
    }
});
