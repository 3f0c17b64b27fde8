//! Identifier generation: device codes, device ids, request correlation ids.

use rand::Rng;
use uuid::Uuid;

/// Alphabet for device activation codes (uppercase alphanumerics).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a device activation code.
pub const DEVICE_CODE_LEN: usize = 6;

/// Attempts at generating a collision-free device code before giving up.
pub const DEVICE_CODE_MAX_ATTEMPTS: usize = 10;

/// Generate a 6-character uppercase alphanumeric device code.
///
/// Uniqueness against the `device_auth_codes` table is the caller's job
/// (regenerate on collision, up to [`DEVICE_CODE_MAX_ATTEMPTS`] times).
pub fn device_code() -> String {
    let mut rng = rand::rng();
    (0..DEVICE_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Generate a device id: `device_<unix-ms>_<9 base36 chars>`.
pub fn device_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| {
            let v = rng.random_range(0..36u32);
            char::from_digit(v, 36).unwrap_or('0')
        })
        .collect();
    format!("device_{millis}_{suffix}")
}

/// Generate a request correlation id.
///
/// 128-bit random, unguessable, never reused within a process lifetime.
pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_code_shape() {
        for _ in 0..100 {
            let code = device_code();
            assert_eq!(code.len(), DEVICE_CODE_LEN);
            assert!(code
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_device_id_shape() {
        let id = device_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "device");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_correlation_ids_distinct() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(correlation_id()));
        }
    }
}
