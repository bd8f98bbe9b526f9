use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

pub const CHALLENGE_BYTES: usize = 64;
pub const SIGNATURE_HEADER: &str = "x-hub-signature";
pub const SIGNATURE_ALGORITHM_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Fresh verification challenge: 64 random bytes, lowercase hex (128 chars).
pub fn generate_challenge() -> String {
    let mut buf = [0_u8; CHALLENGE_BYTES];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("hmac key rejected: {0}")]
    InvalidKey(String),
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`. An empty secret is a valid key.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, SigningError> {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes())
        .map_err(|error| SigningError::InvalidKey(error.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `X-Hub-Signature` header value for `body`.
pub fn signature_header_value(secret: &str, body: &[u8]) -> Result<String, SigningError> {
    Ok(format!(
        "{SIGNATURE_ALGORITHM_PREFIX}{}",
        sign_payload(secret, body)?
    ))
}
