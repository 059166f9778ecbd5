//! Canned responses

use burrow_inject::BoxError;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION, SET_COOKIE, WWW_AUTHENTICATE};
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

fn build(builder: http::response::Builder, body: ProxyBody) -> Response<ProxyBody> {
    builder.body(body).unwrap_or_else(|e| {
        tracing::error!("Failed to build response: {}", e);
        let mut response = Response::new(full("Internal Server Error"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    build(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8"),
        full(body),
    )
}

pub fn json(status: StatusCode, body: &serde_json::Value) -> Response<ProxyBody> {
    build(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json"),
        full(body.to_string()),
    )
}

/// `{"error": <code>, "id": <id>}`
pub fn json_error(status: StatusCode, error: &str, id: Option<&str>) -> Response<ProxyBody> {
    let mut body = serde_json::json!({ "error": error });
    if let Some(id) = id {
        body["id"] = serde_json::Value::String(id.to_string());
    }
    json(status, &body)
}

pub fn redirect(status: StatusCode, location: &str, cookie: Option<&str>) -> Response<ProxyBody> {
    let mut builder = Response::builder()
        .status(status)
        .header(LOCATION, location)
        .header(CACHE_CONTROL, "no-store");
    if let Some(cookie) = cookie {
        builder = builder.header(SET_COOKIE, cookie);
    }
    build(builder, empty())
}

pub fn basic_challenge() -> Response<ProxyBody> {
    build(
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(WWW_AUTHENTICATE, "Basic realm=\"burrow\", charset=\"UTF-8\"")
            .header(CONTENT_TYPE, "text/plain; charset=utf-8"),
        full("Authentication required"),
    )
}
