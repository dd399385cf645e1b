//! The fronting auth server verifies credentials and forwards the Basic
//! `Authorization` header; all that is read here is the username.

use axum::{
    extract::Request,
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use base64::{Engine as _, engine::general_purpose};

pub const DEFAULT_USERNAME: &str = "Default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Username(pub String);

pub fn decode_auth_header(header: &str) -> String {
    let Some((scheme, encoded)) = header.trim().split_once(' ') else {
        return DEFAULT_USERNAME.to_string();
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return DEFAULT_USERNAME.to_string();
    }

    general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|credentials| {
            let username = credentials.split(':').next().unwrap_or_default().to_string();
            (!username.is_empty()).then_some(username)
        })
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string())
}

pub async fn username_layer(mut req: Request, next: Next) -> Response {
    let username = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(decode_auth_header)
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());

    req.extensions_mut().insert(Username(username));
    next.run(req).await
}
