use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// Header Telegram sets on webhook deliveries when a secret was registered.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Check the webhook secret header. Always passes when no secret is configured.
pub fn verify_secret(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    match headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) {
        Some(given) => constant_time_eq(given.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
