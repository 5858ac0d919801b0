//! Binance REST request signing: HMAC-SHA256 signature over the request's
//! query string, as required for authenticated endpoints.
//! See <https://binance-docs.github.io/apidocs/spot/en/#signed-trade-user_data-and-margin-endpoints-security-type>.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Headers required on a signed Binance REST request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub api_key: String,
    pub timestamp: i64,
    pub signature: String,
}

/// Signs `query_string` (already including `timestamp=...`, without a leading `?`) with
/// `secret_key`, returning the hex-encoded HMAC-SHA256 digest.
pub fn sign_query(query_string: &str, secret_key: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(query_string.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Builds the `X-MBX-APIKEY` / `X-MBX-TIMESTAMP` / `X-MBX-SIGNATURE` headers for a signed
/// request whose query string (pre-signature) is `query_string`.
pub fn build_signed_headers(api_key: &str, secret_key: &str, query_string: &str, timestamp: i64) -> SignedHeaders {
    let signed_query = format!("{query_string}&timestamp={timestamp}");
    SignedHeaders {
        api_key: api_key.to_string(),
        timestamp,
        signature: sign_query(&signed_query, secret_key),
    }
}
