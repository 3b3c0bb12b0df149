//! Admin credential policy, generation and digest.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest, Md5};
use rand::seq::{IndexedRandom, SliceRandom};

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 32;

const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
const SPECIAL: &[u8] = b"!@#$%^&*()-_=+[]{}<>?/.~";

/// Characters the management engine refuses inside a credential.
const FORBIDDEN: &[char] = &[':', '"', ','];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PasswordPolicyError {
    #[error("password must be between {MIN_PASSWORD_LEN} and {MAX_PASSWORD_LEN} characters")]
    Length,
    #[error("password must contain at least one {0} character")]
    MissingClass(&'static str),
    #[error("password contains a character the device does not accept")]
    InvalidCharacter,
}

/// Check a caller-supplied credential against the device policy.
pub fn validate_password(password: &str) -> Result<(), PasswordPolicyError> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(PasswordPolicyError::Length);
    }
    if password
        .chars()
        .any(|c| !c.is_ascii_graphic() || FORBIDDEN.contains(&c))
    {
        return Err(PasswordPolicyError::InvalidCharacter);
    }

    let classes: [(&'static str, fn(&char) -> bool); 4] = [
        ("uppercase", char::is_ascii_uppercase),
        ("lowercase", char::is_ascii_lowercase),
        ("digit", char::is_ascii_digit),
        ("special", char::is_ascii_punctuation),
    ];
    for (name, test) in classes {
        if !password.chars().any(|c| test(&c)) {
            return Err(PasswordPolicyError::MissingClass(name));
        }
    }
    Ok(())
}

/// Generate a random credential of `length` characters that satisfies
/// [`validate_password`]. `length` is clamped to the policy bounds.
pub fn generate_password(length: usize) -> String {
    let length = length.clamp(MIN_PASSWORD_LEN, MAX_PASSWORD_LEN);
    let all: Vec<u8> = [UPPER, LOWER, DIGITS, SPECIAL].concat();
    let mut rng = rand::rng();

    // One of each class, then fill from the union.
    let mut chars: Vec<u8> = [UPPER, LOWER, DIGITS, SPECIAL]
        .iter()
        .filter_map(|set| set.choose(&mut rng).copied())
        .collect();
    let missing = length.saturating_sub(chars.len());
    chars.extend((0..missing).filter_map(|_| all.choose(&mut rng).copied()));
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Digest stored in the device ACL: `base64(md5("user:realm:password"))`.
pub fn admin_digest(username: &str, realm: &str, password: &str) -> String {
    let hash = Md5::digest(format!("{username}:{realm}:{password}").as_bytes());
    STANDARD.encode(hash)
}
