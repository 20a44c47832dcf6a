//! HMAC request signing.
//!
//! Every non-public API call is signed over the canonical string
//! `METHOD|PATH|TIMESTAMP|HEX(SHA256(BODY))` with HMAC-SHA256, where PATH
//! includes the query string and BODY is the raw request bytes (empty for
//! GET). The signature travels base64-encoded and is compared in constant
//! time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("HMAC key is not valid base64")]
    BadKey,
}

pub struct RequestSigner {
    secret: Vec<u8>,
}

impl RequestSigner {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    pub fn from_base64_key(key: &str) -> Result<Self, SignerError> {
        let secret = BASE64.decode(key.trim()).map_err(|_| SignerError::BadKey)?;
        Ok(Self { secret })
    }

    fn canonical_string(method: &str, path: &str, timestamp: i64, body: &[u8]) -> String {
        let body_hash = hex_digest(body);
        format!("{}|{path}|{timestamp}|{body_hash}", method.to_uppercase())
    }

    pub fn generate_signature(
        &self,
        method: &str,
        path: &str,
        timestamp: i64,
        body: &[u8],
    ) -> String {
        let canonical = Self::canonical_string(method, path, timestamp, body);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(canonical.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Returns `(timestamp, signature)` for use in request headers.
    pub fn sign(&self, method: &str, path: &str, body: &[u8], now: i64) -> (i64, String) {
        (now, self.generate_signature(method, path, now, body))
    }

    /// Verify a signature over the canonical string. `skew_s` bounds the
    /// replay window: a timestamp further than that from `now` fails.
    /// The comparison is constant time.
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        timestamp: i64,
        signature: &str,
        body: &[u8],
        now: i64,
        skew_s: u32,
    ) -> bool {
        if (now - timestamp).unsigned_abs() > u64::from(skew_s) {
            return false;
        }
        let Ok(claimed) = BASE64.decode(signature.trim()) else {
            return false;
        };
        let canonical = Self::canonical_string(method, path, timestamp, body);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(canonical.as_bytes());
        mac.verify_slice(&claimed).is_ok()
    }

    /// A fresh 256-bit key, base64-encoded.
    pub fn generate_key() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
