//! Secret comparison in constant time.

use subtle::ConstantTimeEq;

/// Compare a stored secret against the one presented in a token.
///
/// The content comparison takes the same time regardless of where the first
/// differing byte sits. Only the lengths are compared in variable time.
pub fn secrets_match(stored: &str, provided: &str) -> bool {
    stored.as_bytes().ct_eq(provided.as_bytes()).into()
}
