//! HMAC-SHA256 handshake authentication helpers.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for message authentication.
pub fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
pub fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Fresh random nonce, hex-encoded.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Sign a handshake identity: returns `(nonce, hmac)`.
pub fn sign_identity(secret: &str, uid: &str) -> (String, String) {
    let nonce = new_nonce();
    let auth_data = format!("{nonce}{uid}");
    let auth_hmac = hmac_sign(secret, auth_data.as_bytes());
    (nonce, auth_hmac)
}

/// Verify a handshake identity signed with [`sign_identity`].
pub fn verify_identity(secret: &str, uid: &str, nonce: &str, auth_hmac: &str) -> bool {
    let expected_data = format!("{nonce}{uid}");
    hmac_verify(secret, expected_data.as_bytes(), auth_hmac)
}
