//! HMAC-SHA256 delivery signatures.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix used by the signature header (`sha256=<hex digest>`).
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign a payload the way the sender does. None if the key is rejected.
pub fn sign(secret: &[u8], payload: &[u8]) -> Option<String> {
  let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
    return None;
  };
  mac.update(payload);
  Some(format!(
    "{}{}",
    SIGNATURE_PREFIX,
    hex::encode(mac.finalize().into_bytes())
  ))
}

/// Check `signature` against the HMAC of `payload`.
///
/// The digest comparison is constant-time. The prefix is optional; anything
/// that is not valid hex fails.
pub fn verify(secret: &[u8], payload: &[u8], signature: &str) -> bool {
  let signature = signature.trim();
  let digest = signature
    .strip_prefix(SIGNATURE_PREFIX)
    .unwrap_or(signature);
  let Ok(expected) = hex::decode(digest) else {
    return false;
  };
  let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
    return false;
  };
  mac.update(payload);
  mac.verify_slice(&expected).is_ok()
}
