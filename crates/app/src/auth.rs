use axum::http::{header::AUTHORIZATION, HeaderMap};
use metrics::counter;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

const BEARER_PREFIX: &str = "Bearer ";

/// Checks `Authorization: Bearer <secret>` against the configured secret.
///
/// Both sides are hashed first so the comparison is constant time even when
/// the lengths differ.
pub fn bearer_authorized(headers: &HeaderMap, secret: &[u8], route: &'static str) -> bool {
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim);

    let authorized = match provided {
        Some(token) if !token.is_empty() => secrets_match(token.as_bytes(), secret),
        _ => false,
    };

    if !authorized {
        counter!("http_unauthorized_total", "route" => route).increment(1);
        warn!(stage = "auth", route, "rejected request with missing or invalid bearer token");
    }
    authorized
}

fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    let provided = Sha256::digest(provided);
    let expected = Sha256::digest(expected);
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).expect("header"));
        headers
    }

    #[test]
    fn accepts_matching_bearer_token() {
        assert!(bearer_authorized(&headers("Bearer s3cret"), b"s3cret", "test"));
    }

    #[test]
    fn rejects_wrong_scheme_token_or_missing_header() {
        assert!(!bearer_authorized(&headers("Bearer nope"), b"s3cret", "test"));
        assert!(!bearer_authorized(&headers("Basic s3cret"), b"s3cret", "test"));
        assert!(!bearer_authorized(&headers("Bearer "), b"s3cret", "test"));
        assert!(!bearer_authorized(&HeaderMap::new(), b"s3cret", "test"));
    }
}
