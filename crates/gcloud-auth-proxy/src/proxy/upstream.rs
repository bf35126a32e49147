//! Sends an already-authenticated request to its destination with `reqwest`.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, header};
use axum::response::Response;

use super::ProxyError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
}

impl Upstream {
    /// Client with redirects disabled; the caller sees upstream redirects as-is.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Forward `req` to `url`, returning the upstream response.
    pub async fn forward(&self, req: Request, url: reqwest::Url) -> Result<Response, ProxyError> {
        let (parts, body) = req.into_parts();

        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ProxyError::ReadBody(e.to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let mut builder = self.client.request(parts.method, url).headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let upstream_resp = builder
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = upstream_resp.status();
        let mut resp_headers = upstream_resp.headers().clone();
        strip_hop_by_hop(&mut resp_headers);
        // Recomputed from the buffered body.
        resp_headers.remove(header::CONTENT_LENGTH);

        let resp_body = upstream_resp
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(format!("failed to read upstream body: {e}")))?;

        let mut resp = Response::new(Body::from(resp_body));
        *resp.status_mut() = status;
        *resp.headers_mut() = resp_headers;
        Ok(resp)
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, Method, StatusCode};

    use super::*;

    #[test]
    fn strips_fixed_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hop", HeaderValue::from_static("1"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer keep-me"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer keep-me");
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn forwards_method_headers_body_and_returns_upstream_response() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PUT)
                    .path("/v1/items/7")
                    .query_param("dry", "true")
                    .header("authorization", "Bearer minted")
                    .body(r#"{"name":"x"}"#);
                then.status(201)
                    .header("x-upstream", "yes")
                    .body("created");
            })
            .await;

        let req = Request::builder()
            .method(Method::PUT)
            .uri("/ignored")
            .header(header::AUTHORIZATION, "Bearer minted")
            .header(header::PROXY_AUTHORIZATION, "Basic secret")
            .body(Body::from(r#"{"name":"x"}"#))
            .unwrap();
        let url = reqwest::Url::parse(&server.url("/v1/items/7?dry=true")).unwrap();

        let resp = Upstream::new().unwrap().forward(req, url).await.unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("x-upstream").unwrap(), "yes");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"created");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn redirects_are_passed_through() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/old");
                then.status(302).header("location", "/new");
            })
            .await;

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let url = reqwest::Url::parse(&server.url("/old")).unwrap();

        let resp = Upstream::new().unwrap().forward(req, url).await.unwrap();

        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/new");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_upstream_error() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let url = reqwest::Url::parse("http://127.0.0.1:1/").unwrap();

        let err = Upstream::new().unwrap().forward(req, url).await.unwrap_err();

        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
