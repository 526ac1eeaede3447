//! One-time confirmation codes
//!
//! Codes live only inside a session's pending action and die with it. The
//! comparison side tolerates the whitespace a speech recognizer tends to
//! insert between spoken digits.

use rand::rngs::OsRng;
use rand::Rng;

/// Digits in a confirmation code.
pub const CODE_LENGTH: usize = 6;

/// Generate a fixed-length numeric code from the OS CSPRNG.
pub fn generate_code() -> String {
    let mut rng = OsRng;
    (0..CODE_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Strip whitespace so "1 2 3 4 5 6" compares equal to "123456".
pub fn normalize_code(code: &str) -> String {
    code.chars().filter(|c| !c.is_whitespace()).collect()
}

/// True when the supplied value matches the stored code after normalization.
pub fn code_matches(supplied: &str, stored: &str) -> bool {
    !stored.is_empty() && normalize_code(supplied) == stored
}
