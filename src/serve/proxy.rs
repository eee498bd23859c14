//! `/api` forwarding to the backend's local port.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use thiserror::Error;

use super::AppState;

/// Request bodies above this are refused with 413 rather than buffered.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Upstream {
    client: reqwest::Client,
    base: String,
}

impl Upstream {
    pub fn localhost(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://localhost:{}", port),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

#[derive(Error, Debug)]
enum ProxyError {
    #[error("request body exceeds {} bytes", MAX_BODY_BYTES)]
    BodyTooLarge,
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

fn skip_header(name: &str) -> bool {
    HOP_BY_HOP.contains(&name) || name == "host" || name == "content-length"
}

pub async fn forward(State(state): State<AppState>, req: Request) -> Response {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    match forward_inner(&state.upstream, req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!("Proxy {}{} failed: {:#}", state.upstream.base(), target, e);
            let message = match &e {
                ProxyError::BodyTooLarge => e.to_string(),
                ProxyError::Upstream(inner) => format!("backend unavailable: {:#}", inner),
            };
            (e.status(), message).into_response()
        }
    }
}

/// Buffer the request body, refusing anything above [`MAX_BODY_BYTES`].
async fn read_limited(body: Body) -> Result<Bytes, ProxyError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(anyhow::Error::from)?;
        if buf.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(ProxyError::BodyTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

fn declared_length(headers: &axum::http::HeaderMap) -> Option<usize> {
    headers
        .get(axum::http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

async fn forward_inner(upstream: &Upstream, req: Request) -> Result<Response, ProxyError> {
    let (parts, body) = req.into_parts();
    if declared_length(&parts.headers).is_some_and(|len| len > MAX_BODY_BYTES) {
        return Err(ProxyError::BodyTooLarge);
    }
    let body = read_limited(body).await?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", upstream.base, path_and_query);

    // axum(http 1.x) 와 reqwest(http 0.2) 의 타입이 달라 문자열/바이트로 옮긴다
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(anyhow::Error::from)?;
    let mut builder = upstream.client.request(method, &url);
    for (name, value) in parts.headers.iter() {
        if skip_header(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let upstream_resp = builder
        .body(body)
        .send()
        .await
        .map_err(anyhow::Error::from)?;
    Ok(into_streaming_response(upstream_resp)?)
}

/// Headers now, body as it arrives (event streams, log follow, long polls).
fn into_streaming_response(upstream_resp: reqwest::Response) -> anyhow::Result<Response> {
    let mut resp = Response::builder().status(StatusCode::from_u16(upstream_resp.status().as_u16())?);
    for (name, value) in upstream_resp.headers() {
        if skip_header(name.as_str()) {
            continue;
        }
        resp = resp.header(
            HeaderName::from_bytes(name.as_str().as_bytes())?,
            HeaderValue::from_bytes(value.as_bytes())?,
        );
    }
    Ok(resp.body(Body::from_stream(upstream_resp.bytes_stream()))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_are_skipped() {
        assert!(skip_header("connection"));
        assert!(skip_header("host"));
        assert!(skip_header("transfer-encoding"));
        assert!(!skip_header("content-type"));
        assert!(!skip_header("authorization"));
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ProxyError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ProxyError::Upstream(anyhow::anyhow!("refused")).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_read_limited_refuses_oversized_body() {
        let small = read_limited(Body::from("hello")).await.unwrap();
        assert_eq!(&small[..], b"hello");

        let big = Body::from(vec![b'x'; MAX_BODY_BYTES + 1]);
        assert!(matches!(read_limited(big).await, Err(ProxyError::BodyTooLarge)));
    }

    #[test]
    fn test_upstream_base() {
        assert_eq!(Upstream::localhost(9090).base(), "http://localhost:9090");
    }
}
