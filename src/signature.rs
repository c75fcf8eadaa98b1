//! HMAC-SHA1 signatures on the external surfaces.
//!
//! Incoming webhooks carry `X-Hub-Signature: sha1=<hex>` over the raw
//! request body; outgoing notifications carry the bare hex digest in
//! `X-Torigoya-Factory-Signature`.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Hex HMAC-SHA1 digest of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a webhook signature header against the stored secret. The header
/// must equal `sha1=` + the hex digest, byte for byte.
pub fn verify_hub_signature(secret: &str, body: &[u8], header: &str) -> bool {
    match sign(secret, body) {
        Ok(digest) => header == format!("sha1={}", digest),
        Err(_) => false,
    }
}
