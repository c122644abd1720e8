use hmac::{Hmac, Mac};
use sha2::Sha256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("X-Hub-Signature-256 sha256= prefix missing")]
    MissingPrefix,
    #[error("X-Hub-Signature-256 malformed")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify an `X-Hub-Signature-256` header value against the raw payload.
pub fn verify_signature(secret: &str, header: &str, body: &[u8]) -> Result<(), SignatureError> {
    let signature_sha256 =
        header.trim().strip_prefix("sha256=").ok_or(SignatureError::MissingPrefix)?;
    let signature = hex::decode(signature_sha256).map_err(|_| SignatureError::Malformed)?;
    let mut mac = mac_for(secret);
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| SignatureError::Mismatch)
}

/// Compute the header value GitHub would send for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn mac_for(secret: &str) -> Hmac<Sha256> {
    Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}
