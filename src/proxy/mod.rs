//! Reverse proxy to the loopback backend.
//!
//! Every request that is not the gated endpoint lands here and is forwarded
//! to `127.0.0.1:<PORT>` with its method, headers, and body intact. There is
//! no admission control; capacity is the backend's problem.

pub mod transport;

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Uri, Version},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::state::AgentState;
use transport::StreamProxyTransport;

/// Connection-scoped headers that must not be forwarded (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct LocalReverseProxy {
    backend: SocketAddr,
    transport: StreamProxyTransport,
}

impl LocalReverseProxy {
    pub fn new(backend: SocketAddr, transport: StreamProxyTransport) -> Self {
        Self { backend, transport }
    }

    pub fn backend(&self) -> SocketAddr {
        self.backend
    }

    /// Forward `request` to the backend. Transport failures become 5xx
    /// responses.
    pub async fn forward(&self, request: Request) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let request = match self.rewrite(request) {
            Ok(r) => r,
            Err(e) => {
                warn!(%method, %path, error = %e, "could not rewrite request");
                return axum::http::StatusCode::BAD_REQUEST.into_response();
            }
        };

        match self.transport.round_trip(request).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => {
                warn!(%method, %path, backend = %self.backend, error = %e, "proxy request failed");
                e.status().into_response()
            }
        }
    }

    fn rewrite(&self, request: Request) -> Result<Request<Body>, axum::http::Error> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        let uri = Uri::builder()
            .scheme("http")
            .authority(self.backend.to_string())
            .path_and_query(path_and_query)
            .build()?;

        // HTTP/2 peers carry the host in the URI, not a header.
        if !parts.headers.contains_key(header::HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    parts.headers.insert(header::HOST, value);
                }
            }
        }
        strip_hop_by_hop(&mut parts.headers);

        parts.uri = uri;
        parts.version = Version::HTTP_11;
        Ok(Request::from_parts(parts, body))
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Fallback handler: everything that is not the gated endpoint.
pub async fn forward(State(state): State<AgentState>, request: Request) -> Response {
    state.proxy.forward(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{http, http::StatusCode, Router};
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;

    use super::transport::RAW_UPGRADE_METHOD;

    async fn backend() -> SocketAddr {
        let app = Router::new().fallback(|request: Request| async move {
            let host = request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let marker = request
                .headers()
                .get("x-marker")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let saw_keep_alive = request.headers().contains_key("keep-alive");
            let method = request.method().clone();
            let uri = request.uri().clone();
            let body = request.into_body().collect().await.unwrap().to_bytes();
            format!(
                "{method} {uri} host={host} marker={marker} keep_alive={saw_keep_alive} body={}",
                String::from_utf8_lossy(&body)
            )
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_method_path_headers_and_body() {
        let addr = backend().await;
        let proxy = LocalReverseProxy::new(addr, StreamProxyTransport::new(None));

        let request = http::Request::builder()
            .method("POST")
            .uri("/submit?x=1")
            .header(header::HOST, "app.example.io")
            .header("x-marker", "kept")
            .header("keep-alive", "timeout=5")
            .body(Body::from("payload"))
            .unwrap();
        let response = proxy.forward(request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        assert!(text.starts_with("POST /submit?x=1 "), "{text}");
        assert!(text.contains("host=app.example.io"), "{text}");
        assert!(text.contains("marker=kept"), "{text}");
        assert!(text.contains("keep_alive=false"), "{text}");
        assert!(text.ends_with("body=payload"), "{text}");
    }

    #[tokio::test]
    async fn test_host_taken_from_absolute_uri() {
        let addr = backend().await;
        let proxy = LocalReverseProxy::new(addr, StreamProxyTransport::new(None));

        let request = http::Request::builder()
            .version(Version::HTTP_2)
            .uri("https://public.example.io/health")
            .body(Body::empty())
            .unwrap();
        let text = body_text(proxy.forward(request).await).await;
        assert!(text.starts_with("GET /health "), "{text}");
        assert!(text.contains("host=public.example.io"), "{text}");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = LocalReverseProxy::new(addr, StreamProxyTransport::new(None));
        let response = proxy
            .forward(http::Request::get("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_raw_upgrade_splices_to_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = sock.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let proxy = LocalReverseProxy::new(
            addr,
            StreamProxyTransport::new(Some(Duration::from_secs(1))),
        );
        let request = http::Request::builder()
            .method(RAW_UPGRADE_METHOD)
            .uri("/socket")
            .body(Body::from("raw bytes"))
            .unwrap();
        let response = proxy.forward(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "raw bytes");
    }

    #[test]
    fn test_strip_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("x-public", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key("x-private"));
        assert!(headers.contains_key("x-public"));
    }
}
