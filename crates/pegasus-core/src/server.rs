//! Shared HTTP response envelope.
//!
//! Successful responses carry `application/json` bodies; errors come back
//! as HTTP 400 with a `text/plain` message body.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub fn json_ok<T: Serialize>(data: &T) -> Response {
    match serde_json::to_string_pretty(data) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => bad_request(format!("fail to encode response, {err}")),
    }
}

pub fn text_ok(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub fn bad_request(msg: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        msg,
    )
        .into_response()
}

/// Fold a fallible handler result into the envelope.
pub fn fmt_resp<T: Serialize, E: std::fmt::Display>(res: Result<T, E>) -> Response {
    match res {
        Ok(data) => json_ok(&data),
        Err(err) => bad_request(err.to_string()),
    }
}
