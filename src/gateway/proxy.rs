//! Reverse-proxy hop to the auth server or the MCP backend.
//!
//! Requests are rebuilt by a fixed director: scheme and host come from the
//! target, the path is the target's base path plus the (possibly mapped)
//! request path, the query is kept, and hop-by-hop headers are dropped.
//! Non-streaming requests are bounded by the configured timeout; streaming
//! requests run until the client or the backend goes away.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header, request::Parts},
    response::Response,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::rejection::Rejection;
use super::sse::{EndpointRewriter, spawn_rewriter};
use crate::Result;
use crate::config::parse_base_url;

/// Headers that never cross the proxy
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
];

/// Resolved upstream location, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    scheme: String,
    authority: String,
    base_path: String,
}

impl ProxyTarget {
    /// Parse a base URL
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL is not a usable http(s) URL.
    pub fn parse(field: &str, url: &str) -> Result<Self> {
        let parsed = parse_base_url(field, url)?;
        // The parser drops default ports; SSE rewriting needs the text as written.
        let authority = match authority_as_written(url) {
            Some(authority) => authority.to_string(),
            None => {
                let host = parsed.host_str().unwrap_or_default();
                match parsed.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                }
            }
        };
        Ok(Self {
            scheme: parsed.scheme().to_string(),
            authority,
            base_path: parsed.path().trim_end_matches('/').to_string(),
        })
    }

    /// `host[:port]`
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// `scheme://host[:port]`
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }

    /// Full upstream URL for a request path and query
    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!("{}{}{path}", self.origin(), self.base_path);
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}

/// `host[:port]` of `raw` as configured, without userinfo
fn authority_as_written(raw: &str) -> Option<&str> {
    let rest = raw.trim().split_once("://")?.1;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    (!authority.is_empty()).then_some(authority)
}

/// Copy `src` without hop-by-hop headers or `Host`
pub fn forwardable_headers(src: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if *name == header::HOST || HOP_BY_HOP.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// HTTP client bound to one [`ProxyTarget`]
#[derive(Clone)]
pub struct Upstream {
    target: ProxyTarget,
    client: reqwest::Client,
    timeout: Duration,
    resource_metadata_url: String,
    shutdown: CancellationToken,
}

impl Upstream {
    /// Create a proxy hop to `target`
    pub fn new(
        target: ProxyTarget,
        client: reqwest::Client,
        timeout: Duration,
        resource_metadata_url: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            client,
            timeout,
            resource_metadata_url: resource_metadata_url.into(),
            shutdown,
        }
    }

    /// Target of this hop
    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Forward a request and relay the response.
    ///
    /// `path` is the path on the target (already mapped). When `streaming`,
    /// no deadline applies and `Origin` is set to the target's origin.
    pub async fn forward(
        &self,
        parts: &Parts,
        path: &str,
        body: reqwest::Body,
        streaming: bool,
    ) -> std::result::Result<Response, Rejection> {
        let url = self.target.url_for(path, parts.uri.query());
        let mut headers = forwardable_headers(&parts.headers);
        if streaming {
            if let Ok(origin) = HeaderValue::from_str(&self.target.origin()) {
                headers.insert(header::ORIGIN, origin);
            }
        }

        debug!(method = %parts.method, url = %url, streaming, "Proxying request");
        let mut request = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(body);
        if !streaming {
            request = request.timeout(self.timeout);
        }

        let upstream = request.send().await.map_err(|e| {
            warn!(url = %url, error = %e, timeout = e.is_timeout(), "Upstream request failed");
            Rejection::BadGateway
        })?;

        let proxy_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(self.target.authority());
        Ok(self.relay(upstream, proxy_host))
    }

    fn relay(&self, upstream: reqwest::Response, proxy_host: &str) -> Response {
        let status = upstream.status();
        let mut headers = forwardable_headers(upstream.headers());
        headers.remove(header::ACCESS_CONTROL_ALLOW_ORIGIN);

        if status == StatusCode::UNAUTHORIZED {
            let challenge = format!("Bearer resource_metadata=\"{}\"", self.resource_metadata_url);
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
            headers.insert(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static("WWW-Authenticate"),
            );
        }

        let is_event_stream = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().starts_with("text/event-stream"));

        let body = if is_event_stream {
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

            let rewriter = EndpointRewriter::new(self.target.authority(), proxy_host);
            let (stream, _task) =
                spawn_rewriter(upstream.bytes_stream(), rewriter, self.shutdown.clone());
            Body::from_stream(stream)
        } else {
            Body::from_stream(upstream.bytes_stream())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_keeps_port_and_base_path() {
        let t = ProxyTarget::parse("backend.base_url", "http://backend:9000/mcp/").unwrap();
        assert_eq!(t.authority(), "backend:9000");
        assert_eq!(t.origin(), "http://backend:9000");
        assert_eq!(
            t.url_for("/messages", Some("sessionId=abc")),
            "http://backend:9000/mcp/messages?sessionId=abc"
        );
    }

    #[test]
    fn target_without_path_or_query() {
        let t = ProxyTarget::parse("x", "https://idp.example.com").unwrap();
        assert_eq!(t.url_for("/token", None), "https://idp.example.com/token");
        assert_eq!(t.url_for("/token", Some("")), "https://idp.example.com/token");
    }

    #[test]
    fn explicit_default_port_is_kept() {
        // GIVEN: a backend configured with its scheme's default port
        let t = ProxyTarget::parse("backend.base_url", "http://localhost:80").unwrap();

        // THEN: the authority matches what the backend announces in SSE
        assert_eq!(t.authority(), "localhost:80");
        assert_eq!(t.url_for("/sse", None), "http://localhost:80/sse");

        let mut rewriter = EndpointRewriter::new(t.authority(), "proxy.example:8080");
        rewriter.rewrite_line(b"event: endpoint\n");
        let out = rewriter.rewrite_line(b"data: http://localhost:80/messages?sessionId=1\n");
        assert_eq!(
            &*out,
            b"data: http://proxy.example:8080/messages?sessionId=1\n"
        );
    }

    #[test]
    fn userinfo_is_not_part_of_the_authority() {
        let t = ProxyTarget::parse("x", "https://user:pw@idp.example.com:8443/oauth2").unwrap();
        assert_eq!(t.authority(), "idp.example.com:8443");
        assert_eq!(t.url_for("/token", None), "https://idp.example.com:8443/oauth2/token");
    }

    #[test]
    fn unparseable_target_is_a_config_error() {
        assert!(ProxyTarget::parse("backend.base_url", "::nope").is_err());
        assert!(ProxyTarget::parse("backend.base_url", "ftp://files.example.com").is_err());
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut src = HeaderMap::new();
        for (k, v) in [
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("proxy-authorization", "Basic x"),
            ("proxy-connection", "keep-alive"),
            ("te", "trailers"),
            ("trailer", "Expires"),
            ("host", "proxy.example:8080"),
            ("authorization", "Bearer t"),
            ("mcp-protocol-version", "2025-06-18"),
        ] {
            src.insert(HeaderName::from_static(k), HeaderValue::from_static(v));
        }
        src.append("x-multi", HeaderValue::from_static("a"));
        src.append("x-multi", HeaderValue::from_static("b"));

        let out = forwardable_headers(&src);

        assert_eq!(out.len(), 4);
        assert_eq!(out["authorization"], "Bearer t");
        assert_eq!(out.get_all("x-multi").iter().count(), 2);
        assert!(out.get(header::HOST).is_none());
    }
}
