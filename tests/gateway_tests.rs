//! End-to-end request pipeline tests
//!
//! Drives the router with `oneshot` against wiremock stand-ins for the MCP
//! backend and the identity provider:
//! - CORS gate and path classification
//! - Bearer validation per protocol era
//! - Scope policy on JSON-RPC bodies
//! - Auth-plane parameter injection
//! - Response rewriting (401 challenges, SSE endpoint events)

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, header as has_header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_auth_proxy::auth::KeyStore;
use mcp_auth_proxy::config::{Config, PathConfig};
use mcp_auth_proxy::gateway::{AppState, create_router};
use mcp_auth_proxy::policy::MethodScopes;

const PRIMARY_PEM: &str = include_str!("fixtures/primary_key.pem");
const PRIMARY_N: &str = "vZFKaQFk9i31pVW5-2p8tMSNkXmPDuD83qawfd6kdSvxaM6JmVtlQJsoTgJQ5cwiKq7kDUBr1ERc2FlDRdJGfQ5slMFxH3K05o4Pwg0KjmRqaTW51dzLADugn0zIgTgTmMNY-bZ-5ubA9kc2MJmDP1zDdD_BR8vbABEScfoFuw3D4T5utlvLl6ocz6xPlcR3ZtzqR0ciAPdS8l_q_dZ_MuyRgBh9dM5lChBpUzdArA1PTqW8_TulolSAMFLAAGbyrooeEIS95o2eA-4HVAJCfpqbTEDSJjwCBBhAytrXPIpv7OFAHVmWhUxJr39s0V2BqRu2AodQD3pS_kW_e05yGw";
const RESOURCE: &str = "https://mcp.example.com";
const ALLOWED_ORIGIN: &str = "http://localhost:6274";
const CURRENT: &str = "2025-06-18";
const LEGACY: &str = "2024-11-05";

struct Harness {
    app: Router,
    backend: MockServer,
    idp: MockServer,
}

impl Harness {
    async fn start(customize: impl FnOnce(&mut Config)) -> Self {
        let backend = MockServer::start().await;
        let idp = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [
                    {"kty": "EC", "kid": "ec", "crv": "P-256", "x": "x", "y": "y"},
                    {"kty": "RSA", "kid": "primary", "n": PRIMARY_N, "e": "AQAB"}
                ]
            })))
            .mount(&idp)
            .await;

        let mut config = Config::default();
        config.backend.base_url = backend.uri();
        config.auth_server.base_url = idp.uri();
        config.auth_server.jwks_url = format!("{}/jwks", idp.uri());
        config.resource.identifier = RESOURCE.to_string();
        config.cors.allowed_origins = vec![ALLOWED_ORIGIN.to_string()];
        customize(&mut config);
        config.apply_defaults();
        config.validate().unwrap();

        let keys = Arc::new(KeyStore::new(config.auth_server.jwks_url.clone()).unwrap());
        assert_eq!(keys.refresh().await.unwrap(), 1);
        let state = AppState::new(&config, keys, CancellationToken::new()).unwrap();

        Self {
            app: create_router(Arc::new(state)),
            backend,
            idp,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }
}

fn token(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("primary".to_string());
    let key = EncodingKey::from_rsa_pem(PRIMARY_PEM.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

fn claims(scope: &str) -> Value {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    json!({"sub": "user-1", "aud": RESOURCE, "scope": scope, "exp": now + 3600})
}

fn rpc_post(uri: &str, version: &str, bearer: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("mcp-protocol-version", version);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn tools_call(tool: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": tool}})
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn require_tools_write(config: &mut Config) {
    config.required_scopes.insert(
        "tools/call".to_string(),
        serde_json::from_value::<MethodScopes>(json!("tools.write")).unwrap(),
    );
}

#[tokio::test]
async fn sse_without_token_on_current_protocol_gets_challenge() {
    // GIVEN: a client on a protocol revision after the cutover
    let h = Harness::start(|_| {}).await;
    let request = Request::get("/sse")
        .header("mcp-protocol-version", CURRENT)
        .body(Body::empty())
        .unwrap();

    // WHEN: it opens the stream without a token
    let response = h.send(request).await;

    // THEN: 401 points at the protected-resource metadata, backend untouched
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
    assert_eq!(
        challenge,
        "Bearer resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
    );
    assert!(
        response.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS]
            .to_str()
            .unwrap()
            .contains("WWW-Authenticate")
    );
    assert!(h.backend.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn legacy_client_without_token_gets_bare_401() {
    let h = Harness::start(|_| {}).await;
    let response = h
        .send(Request::get("/sse").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
}

#[tokio::test]
async fn insufficient_scope_is_forbidden_with_reason() {
    // GIVEN: tools/call requires tools.write and the token only has tools.read
    let h = Harness::start(require_tools_write).await;
    let bearer = token(&claims("tools.read"));

    // WHEN: the client calls a tool
    let response = h
        .send(rpc_post(
            "/messages?sessionId=1",
            CURRENT,
            Some(&bearer),
            &tools_call("search"),
        ))
        .await;

    // THEN: 403 names the missing scope in the body only
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    assert!(body_text(response).await.contains("tools.write"));
    assert!(h.backend.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn permitted_call_is_forwarded_unchanged() {
    // GIVEN: a token holding the required scope
    let h = Harness::start(require_tools_write).await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(query_param("sessionId", "1"))
        .respond_with(ResponseTemplate::new(202).set_body_string("Accepted"))
        .expect(1)
        .mount(&h.backend)
        .await;
    let bearer = token(&claims("tools.read tools.write"));
    let call = tools_call("search");

    // WHEN: the call is sent
    let response = h
        .send(rpc_post("/messages?sessionId=1", CURRENT, Some(&bearer), &call))
        .await;

    // THEN: the backend sees the original body and credentials
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let received = h.backend.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let forwarded: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(forwarded, call);
    assert_eq!(
        received[0].headers["authorization"].to_str().unwrap(),
        format!("Bearer {bearer}")
    );
}

#[tokio::test]
async fn malformed_jsonrpc_is_bad_request() {
    let h = Harness::start(require_tools_write).await;
    let bearer = token(&claims("tools.write"));
    let request = Request::post("/messages")
        .header("mcp-protocol-version", CURRENT)
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::from("{not json"))
        .unwrap();

    let response = h.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_jsonrpc_is_bad_request_without_scope_policy() {
    // GIVEN: no required scopes configured
    let h = Harness::start(|_| {}).await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&h.backend)
        .await;
    let bearer = token(&claims("tools.read"));

    // WHEN: a current-protocol client posts a body that is not JSON-RPC
    let response = h
        .send(
            Request::post("/messages")
                .header("mcp-protocol-version", CURRENT)
                .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;

    // THEN: it is rejected before reaching the backend
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.backend.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn legacy_token_without_audience_is_accepted() {
    // GIVEN: a signed token with no aud claim and a pre-cutover client
    let h = Harness::start(require_tools_write).await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&h.backend)
        .await;
    let bearer = token(&json!({"sub": "legacy"}));

    // WHEN: it calls a tool it has no scope for
    let response = h
        .send(rpc_post("/messages", LEGACY, Some(&bearer), &tools_call("search")))
        .await;

    // THEN: signature alone is enough
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn current_token_for_another_audience_is_rejected() {
    let h = Harness::start(|_| {}).await;
    let bearer = token(&json!({"aud": "https://other.example.com", "scope": "tools.write"}));

    let response = h
        .send(rpc_post("/messages", CURRENT, Some(&bearer), &tools_call("x")))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_some());
}

#[tokio::test]
async fn token_request_gains_configured_body_params() {
    // GIVEN: /token configured to carry an audience
    let h = Harness::start(|config| {
        config.auth_server.paths.insert(
            "/token".to_string(),
            PathConfig {
                add_body_params: [("audience".to_string(), json!("api://mcp"))]
                    .into_iter()
                    .collect(),
                ..PathConfig::default()
            },
        );
    })
    .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("audience=api%3A%2F%2Fmcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "t"})))
        .expect(1)
        .mount(&h.idp)
        .await;

    // WHEN: a client exchanges a code
    let form = "grant_type=authorization_code&code=abc";
    let response = h
        .send(
            Request::post("/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(header::CONTENT_LENGTH, form.len())
                .body(Body::from(form))
                .unwrap(),
        )
        .await;

    // THEN: the provider sees the amended body with a matching length
    assert_eq!(response.status(), StatusCode::OK);
    let received = h
        .idp
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path() == "/token")
        .unwrap();
    let body = String::from_utf8(received.body.clone()).unwrap();
    assert_eq!(body, "grant_type=authorization_code&code=abc&audience=api%3A%2F%2Fmcp");
    assert_eq!(
        received.headers["content-length"].to_str().unwrap(),
        body.len().to_string()
    );
}

#[tokio::test]
async fn authorize_redirect_is_passed_through() {
    // GIVEN: the provider answers /authorize with a login redirect
    let h = Harness::start(|config| {
        config.auth_server.paths.insert(
            "/authorize".to_string(),
            PathConfig {
                add_query_params: [("audience".to_string(), json!("api://mcp"))]
                    .into_iter()
                    .collect(),
                ..PathConfig::default()
            },
        );
    })
    .await;
    Mock::given(method("GET"))
        .and(path("/authorize"))
        .and(query_param("client_id", "abc"))
        .and(query_param("audience", "api://mcp"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", "https://login.example.com/"),
        )
        .expect(1)
        .mount(&h.idp)
        .await;

    // WHEN: the browser starts the flow
    let response = h
        .send(
            Request::get("/authorize?client_id=abc&audience=evil")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    // THEN: the redirect reaches the browser instead of being followed
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "https://login.example.com/");
}

#[tokio::test]
async fn unknown_path_is_forbidden() {
    let h = Harness::start(|_| {}).await;
    let response = h
        .send(Request::get("/admin").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(h.backend.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn origin_outside_allow_list_is_rejected_first() {
    let h = Harness::start(|_| {}).await;
    let bearer = token(&claims("tools.write"));
    let mut request = rpc_post("/messages", CURRENT, Some(&bearer), &tools_call("x"));
    request
        .headers_mut()
        .insert(header::ORIGIN, "https://evil.example".parse().unwrap());

    let response = h.send(request).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none()
    );
}

#[tokio::test]
async fn allowed_origin_is_echoed_on_rejections_too() {
    let h = Harness::start(|_| {}).await;
    let response = h
        .send(
            Request::get("/sse")
                .header(header::ORIGIN, ALLOWED_ORIGIN)
                .header("mcp-protocol-version", CURRENT)
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        ALLOWED_ORIGIN
    );
    assert_eq!(response.headers()[header::VARY], "Origin");
}

#[tokio::test]
async fn preflight_is_answered_locally() {
    let h = Harness::start(|_| {}).await;
    let response = h
        .send(
            Request::options("/messages")
                .header(header::ORIGIN, ALLOWED_ORIGIN)
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization, mcp-protocol-version")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
        "authorization, mcp-protocol-version"
    );
    assert!(h.backend.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn backend_401_points_at_proxy_metadata() {
    // GIVEN: a backend that rejects the request with its own challenge
    let h = Harness::start(|_| {}).await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("www-authenticate", "Bearer realm=\"backend\"")
                .insert_header("access-control-allow-origin", "*"),
        )
        .mount(&h.backend)
        .await;
    let bearer = token(&json!({"sub": "legacy"}));

    // WHEN: a legacy client gets through to it
    let response = h
        .send(rpc_post("/messages", LEGACY, Some(&bearer), &tools_call("x")))
        .await;

    // THEN: the challenge names this proxy and the backend's CORS header is gone
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(
        response.headers()[header::WWW_AUTHENTICATE]
            .to_str()
            .unwrap()
            .contains("https://mcp.example.com/.well-known/oauth-protected-resource")
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        ALLOWED_ORIGIN
    );
}

#[tokio::test]
async fn sse_endpoint_event_is_rewritten_to_proxy_host() {
    // GIVEN: a backend announcing its own address in the endpoint event
    let h = Harness::start(|_| {}).await;
    let backend_url = h.backend.uri();
    let stream = format!(
        "event: endpoint\ndata: {backend_url}/messages?sessionId=abc\n\n: ping\n\n"
    );
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(stream, "text/event-stream"))
        .mount(&h.backend)
        .await;
    let bearer = token(&claims("tools.read"));

    // WHEN: the client opens the stream through the proxy
    let response = h
        .send(
            Request::get("/sse")
                .header(header::HOST, "proxy.example:8080")
                .header("mcp-protocol-version", CURRENT)
                .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    // THEN: the endpoint names the proxy and everything else is untouched
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(
        body_text(response).await,
        "event: endpoint\ndata: http://proxy.example:8080/messages?sessionId=abc\n\n: ping\n\n"
    );

    let received = h.backend.received_requests().await.unwrap();
    assert_eq!(received[0].headers["origin"].to_str().unwrap(), backend_url);
}

#[tokio::test]
async fn protected_resource_metadata_is_served_locally() {
    let h = Harness::start(|config| {
        config.resource.scopes_supported = vec!["tools.read".into(), "tools.write".into()];
        config.resource.authorization_servers = vec!["https://idp.example.com".into()];
    })
    .await;

    let response = h
        .send(
            Request::get("/.well-known/oauth-protected-resource")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let doc: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(doc["resource"], RESOURCE);
    assert_eq!(doc["audience"], RESOURCE);
    assert_eq!(doc["scopes_supported"], json!(["tools.read", "tools.write"]));
    assert_eq!(doc["authorization_servers"], json!(["https://idp.example.com"]));
    assert_eq!(doc["bearer_methods_supported"], json!(["header"]));
}

#[tokio::test]
async fn authorization_metadata_is_proxied_in_default_mode() {
    let h = Harness::start(|_| {}).await;
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"issuer": "https://idp.example.com"})),
        )
        .expect(1)
        .mount(&h.idp)
        .await;

    let response = h
        .send(
            Request::get("/.well-known/oauth-authorization-server")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let doc: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(doc["issuer"], "https://idp.example.com");
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
    let h = Harness::start(|config| {
        config.backend.base_url = "http://127.0.0.1:9".to_string();
    })
    .await;
    let bearer = token(&json!({"sub": "legacy"}));

    let response = h
        .send(rpc_post("/messages", LEGACY, Some(&bearer), &tools_call("x")))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_text(response).await, "Bad Gateway");
}

#[tokio::test]
async fn slow_backend_exceeds_request_timeout() {
    // GIVEN: a backend slower than the configured deadline
    let h = Harness::start(|config| {
        config.server.request_timeout = Duration::from_millis(200);
    })
    .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_secs(2)))
        .mount(&h.backend)
        .await;
    let bearer = token(&claims("tools.read"));

    // WHEN: a message is posted
    let response = h
        .send(rpc_post("/messages", CURRENT, Some(&bearer), &tools_call("search")))
        .await;

    // THEN: the hop is abandoned with a 502
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_text(response).await, "Bad Gateway");
}

#[tokio::test]
async fn sse_stream_outlives_request_timeout() {
    // GIVEN: a short deadline and an SSE backend that answers after it
    let h = Harness::start(|config| {
        config.server.request_timeout = Duration::from_millis(200);
    })
    .await;
    let backend_url = h.backend.uri();
    Mock::given(method("GET"))
        .and(path("/sse"))
        .and(has_header("origin", backend_url.as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(": ping\n\n", "text/event-stream")
                .set_delay(Duration::from_millis(800)),
        )
        .expect(1)
        .mount(&h.backend)
        .await;
    let bearer = token(&claims("tools.read"));

    // WHEN: the client opens the stream from a browser origin
    let response = h
        .send(
            Request::get("/sse")
                .header(header::ORIGIN, ALLOWED_ORIGIN)
                .header("mcp-protocol-version", CURRENT)
                .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    // THEN: no deadline applies and the backend saw its own origin
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        ALLOWED_ORIGIN
    );
    assert_eq!(body_text(response).await, ": ping\n\n");
}
