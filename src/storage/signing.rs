//! HMAC-SHA256 signed download links for stores without native presigning.
//!
//! A link has the form `{base}/{key}?expires={unix}&signature={hex}` where
//! the signature is `HexEncode(HMAC-SHA256(secret, key + "\n" + expires))`.
//! Whatever serves `{base}` verifies the pair with [`UrlSigner::verify`].

use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Longest lifetime a link may carry (7 days).
const MAX_EXPIRES_SECS: u64 = 604_800;

/// Unreserved characters plus `/`, which separates key segments.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Issues and verifies signed links.
#[derive(Clone)]
pub struct UrlSigner {
    base_url: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(base_url: &str, secret: &str) -> anyhow::Result<Self> {
        if secret.is_empty() {
            anyhow::bail!("signing secret must not be empty");
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.as_bytes().to_vec(),
        })
    }

    /// Signed URL for `key` valid for `ttl` from now.
    pub fn sign(&self, key: &str, ttl: Duration) -> anyhow::Result<String> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let expires = now + ttl.as_secs().clamp(1, MAX_EXPIRES_SECS);
        Ok(self.sign_until(key, expires))
    }

    fn sign_until(&self, key: &str, expires: u64) -> String {
        let signature = self.signature(key, expires);
        format!(
            "{}/{}?expires={}&signature={}",
            self.base_url,
            utf8_percent_encode(key, KEY_ENCODE_SET),
            expires,
            signature
        )
    }

    fn signature(&self, key: &str, expires: u64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check a link's `expires`/`signature` pair at time `now` (unix secs).
    pub fn verify(&self, key: &str, expires: u64, signature: &str, now: u64) -> bool {
        if now > expires {
            return false;
        }
        let expected = self.signature(key, expires);
        if expected.len() != signature.len() {
            return false;
        }
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}
