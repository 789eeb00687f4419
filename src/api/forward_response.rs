//! Turns a `ForwardResponse` into the axum response sent back to the
//! caller. Shared by the Anthropic/OpenAI/Gemini handlers since the
//! Forwarding Engine already produced protocol-correct bytes/JSON.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::forwarding::engine::{ForwardBody, ForwardResponse};

pub fn render(response: ForwardResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    match response.body {
        ForwardBody::Json(value) => (status, Json(value)).into_response(),
        ForwardBody::Raw { bytes, content_type } => {
            let mut resp = (status, bytes).into_response();
            let header_value = HeaderValue::from_str(&content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("text/event-stream"));
            resp.headers_mut().insert(axum::http::header::CONTENT_TYPE, header_value);
            resp
        }
        ForwardBody::Stream { stream, content_type } => {
            let body = axum::body::Body::from_stream(stream);
            let mut resp = (status, body).into_response();
            let header_value = HeaderValue::from_str(&content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("text/event-stream"));
            resp.headers_mut().insert(axum::http::header::CONTENT_TYPE, header_value);
            resp
        }
    }
}
