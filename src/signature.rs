//! HMAC-SHA256 signatures over ordered `name=value` field lists.
//!
//! The signed message is always produced by [`signed_message`] from an explicit
//! field list, never by hand-formatting a string, so whitespace can't leak into
//! the digest input.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Joins `name=value` pairs with commas, in the given order.
pub fn signed_message<N, V>(fields: &[(N, V)]) -> String
where
    N: AsRef<str>,
    V: AsRef<str>,
{
    fields
        .iter()
        .map(|(name, value)| format!("{}={}", name.as_ref(), value.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a `signed_field_names` attribute into field names.
/// Returns `None` when the list is empty or contains an empty name.
pub fn parse_field_names(list: &str) -> Option<Vec<&str>> {
    let names: Vec<&str> = list.split(',').map(str::trim).collect();
    if names.iter().any(|name| name.is_empty()) {
        return None;
    }
    Some(names)
}

/// Base64 of the raw HMAC-SHA256 digest of `message` under `secret`.
pub fn sign(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Recomputes the digest and compares it in constant time.
pub fn verify(secret: &str, message: &str, signature: &str) -> bool {
    let provided = match STANDARD.decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    mac.verify_slice(&provided).is_ok()
}
