//! Signed download URLs for disks that have no native presigning.
//!
//! Signature = hex(HMAC-SHA256(secret, key || "\n" || expires || "\n" || filename)).

use crate::traits::{StorageError, StorageResult};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Characters left unescaped in query values.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn mac_for(
    secret: &[u8],
    storage_key: &str,
    expires_at: i64,
    filename: Option<&str>,
) -> StorageResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| StorageError::ConfigError(format!("Invalid signing secret: {}", e)))?;
    mac.update(storage_key.as_bytes());
    mac.update(b"\n");
    mac.update(expires_at.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(filename.unwrap_or_default().as_bytes());
    Ok(mac)
}

pub fn sign(
    secret: &[u8],
    storage_key: &str,
    expires_at: i64,
    filename: Option<&str>,
) -> StorageResult<String> {
    let mac = mac_for(secret, storage_key, expires_at, filename)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks the signature and the expiry against `now` (unix seconds).
pub fn verify(
    secret: &[u8],
    storage_key: &str,
    expires_at: i64,
    filename: Option<&str>,
    signature: &str,
    now: i64,
) -> StorageResult<()> {
    let tag = hex::decode(signature)
        .map_err(|_| StorageError::InvalidKey("Invalid download signature".to_string()))?;
    let mac = mac_for(secret, storage_key, expires_at, filename)?;
    mac.verify_slice(&tag)
        .map_err(|_| StorageError::InvalidKey("Invalid download signature".to_string()))?;
    if now > expires_at {
        return Err(StorageError::InvalidKey(
            "Download link has expired".to_string(),
        ));
    }
    Ok(())
}

/// `{base_url}/{key}?expires=..&filename=..&signature=..`
pub fn signed_url(
    base_url: &str,
    secret: &[u8],
    storage_key: &str,
    expires_at: i64,
    filename: Option<&str>,
) -> StorageResult<String> {
    let signature = sign(secret, storage_key, expires_at, filename)?;
    let mut url = format!(
        "{}/{}?expires={}",
        base_url.trim_end_matches('/'),
        storage_key,
        expires_at
    );
    if let Some(name) = filename {
        url.push_str("&filename=");
        url.push_str(&utf8_percent_encode(name, QUERY_VALUE).to_string());
    }
    url.push_str("&signature=");
    url.push_str(&signature);
    Ok(url)
}
