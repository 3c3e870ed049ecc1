//! ULID generation and parsing.
//!
//! A ULID is a 48-bit millisecond timestamp followed by 80 random bits,
//! encoded as 26 characters of Crockford's Base32. Two ULIDs generated in
//! the same millisecond are made monotonic by incrementing the random
//! portion of the previous one rather than drawing fresh randomness.

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use std::sync::Mutex;

const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ULID_LEN: usize = 26;

struct MonotonicState {
    last_ms: u64,
    last_random: u128,
}

static STATE: Mutex<Option<MonotonicState>> = Mutex::new(None);

/// Generate a new ULID string, monotonic within the same millisecond.
pub fn generate_id() -> String {
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;
    let mut guard = STATE.lock().expect("ulid state mutex poisoned");

    let random = match guard.as_mut() {
        Some(state) if state.last_ms == now_ms => {
            state.last_random = state.last_random.wrapping_add(1);
            state.last_random
        }
        _ => {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes[6..]);
            let r = u128::from_be_bytes(bytes) & ((1u128 << 80) - 1);
            *guard = Some(MonotonicState {
                last_ms: now_ms,
                last_random: r,
            });
            r
        }
    };

    encode(now_ms, random)
}

fn encode(timestamp_ms: u64, random: u128) -> String {
    let mut out = [0u8; ULID_LEN];

    // 48-bit timestamp -> 10 base32 characters (most significant first).
    let mut ts = timestamp_ms;
    for i in (0..10).rev() {
        out[i] = ENCODING[(ts & 0x1f) as usize];
        ts >>= 5;
    }

    // 80-bit randomness -> 16 base32 characters.
    let mut r = random;
    for i in (10..26).rev() {
        out[i] = ENCODING[(r & 0x1f) as usize];
        r >>= 5;
    }

    String::from_utf8(out.to_vec()).expect("ulid alphabet is ASCII")
}

fn decode_char(c: u8) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    ENCODING.iter().position(|&e| e == c).map(|p| p as u8)
}

/// Validate that `s` is a syntactically well-formed ULID (26 characters,
/// Crockford Base32 alphabet).
pub fn is_valid_ulid(s: &str) -> bool {
    s.len() == ULID_LEN && s.bytes().all(|b| decode_char(b).is_some())
}

/// Decode a ULID's leading 48 timestamp bits back into a UTC timestamp.
///
/// Supplementary helper used by log/debug tooling; not on any validation
/// hot path.
pub fn extract_timestamp(id: &str) -> Result<DateTime<Utc>, crate::CoreError> {
    if id.len() != ULID_LEN {
        return Err(crate::CoreError::InvalidUlid(id.to_string()));
    }
    let mut ms: u64 = 0;
    for &b in &id.as_bytes()[0..10] {
        let v = decode_char(b).ok_or_else(|| crate::CoreError::InvalidUlid(id.to_string()))?;
        ms = (ms << 5) | v as u64;
    }
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .ok_or_else(|| crate::CoreError::InvalidUlid(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn generated_id_has_expected_shape() {
        let id = generate_id();
        assert_eq!(id.len(), ULID_LEN);
        assert!(is_valid_ulid(&id));
    }

    #[test]
    fn ids_are_monotonic_within_same_millisecond() {
        let ids: Vec<String> = (0..50).map(|_| generate_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} should sort before {}", pair[0], pair[1]);
        }
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    }

    #[test]
    fn ids_separated_by_time_sort_by_creation() {
        let first = generate_id();
        sleep(Duration::from_millis(5));
        let second = generate_id();
        assert!(first < second);
    }

    #[test]
    fn rejects_malformed_ulid() {
        assert!(!is_valid_ulid("too-short"));
        assert!(!is_valid_ulid(&"I".repeat(26))); // I is not in Crockford's alphabet
    }

    #[test]
    fn extract_timestamp_roundtrips_generation_time() {
        let before = Utc::now();
        let id = generate_id();
        let ts = extract_timestamp(&id).unwrap();
        let after = Utc::now();
        assert!(ts >= before - chrono::Duration::milliseconds(1));
        assert!(ts <= after + chrono::Duration::milliseconds(1));
    }

    #[test]
    fn extract_timestamp_rejects_bad_input() {
        assert!(extract_timestamp("not-a-ulid").is_err());
    }
}
