use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::BillingError;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock distance between the signed timestamp and `now`.
pub const DEFAULT_SIGNATURE_TOLERANCE: Duration = Duration::seconds(300);

/// Verifies a `t=<unix>,v1=<hex>` signature header against the raw body.
///
/// The signed message is `"{t}.{payload}"` under HMAC-SHA256. Any one
/// matching `v1` entry is accepted; other schemes in the header are ignored.
///
/// # Errors
/// Returns [`BillingError::Signature`] when the header is malformed, the
/// timestamp is outside `tolerance`, or no signature matches.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: OffsetDateTime,
    tolerance: Duration,
) -> Result<(), BillingError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => candidates.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return Err(BillingError::Signature(
            "unable to extract timestamp from signature header".to_string(),
        ));
    };

    if candidates.is_empty() {
        return Err(BillingError::Signature(
            "no v1 signatures found in signature header".to_string(),
        ));
    }

    let skew = now.unix_timestamp().saturating_sub(timestamp).saturating_abs();
    if skew > tolerance.whole_seconds() {
        return Err(BillingError::Signature(
            "timestamp outside the tolerance zone".to_string(),
        ));
    }

    let mac = keyed_mac(payload, secret, timestamp)?;
    let matched = candidates.into_iter().any(|candidate| {
        hex::decode(candidate)
            .map(|expected| mac.clone().verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(BillingError::Signature(
            "no signatures found matching the expected signature for payload".to_string(),
        ))
    }
}

/// Produces a signature header for `payload`, as the provider would.
///
/// # Errors
/// Returns [`BillingError::Configuration`] when the secret cannot key an HMAC.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, BillingError> {
    let digest = keyed_mac(payload, secret, timestamp)?.finalize().into_bytes();
    Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
}

fn keyed_mac(payload: &[u8], secret: &str, timestamp: i64) -> Result<HmacSha256, BillingError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| BillingError::Configuration(format!("invalid webhook secret: {err}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}
