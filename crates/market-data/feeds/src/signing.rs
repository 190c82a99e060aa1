//! HMAC-SHA256 request signing for the spot REST API

use crate::error::{ExchangeError, ExchangeResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `payload` under `secret`
pub fn sign(secret: &str, payload: &str) -> ExchangeResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::InvalidRequest(format!("HMAC key error: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Form-encode parameters in key order; the signature covers exactly this string
#[must_use]
pub fn encode_query(params: &BTreeMap<String, String>) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in params {
        ser.append_pair(k, v);
    }
    ser.finish()
}

/// Add `timestamp` and `recvWindow`, then append the signature
pub fn signed_query(
    secret: &str,
    params: &mut BTreeMap<String, String>,
    timestamp_ms: i64,
    recv_window_ms: u64,
) -> ExchangeResult<String> {
    params.insert("timestamp".to_string(), timestamp_ms.to_string());
    params.insert("recvWindow".to_string(), recv_window_ms.to_string());
    let query = encode_query(params);
    let signature = sign(secret, &query)?;
    Ok(format!("{query}&signature={signature}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vector() {
        // Published example from the exchange API documentation
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_signed_query_orders_keys_and_appends_signature() {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), "BTCUSDT".to_string());
        let q = signed_query("k", &mut params, 1_700_000_000_000, 5_000).unwrap();
        assert!(q.starts_with("recvWindow=5000&symbol=BTCUSDT&timestamp=1700000000000&signature="));
        let (payload, sig) = q.rsplit_once("&signature=").unwrap();
        assert_eq!(sig, sign("k", payload).unwrap());
    }
}
