//! Client-visible request failures

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// Why a request was not proxied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// 401; `challenge` carries the protected-resource metadata URL when the
    /// client speaks a protocol revision that understands it
    Unauthorized {
        /// Metadata URL for `WWW-Authenticate`
        challenge: Option<String>,
        /// Body text
        reason: String,
    },
    /// 403 with the reason in the body only
    Forbidden(String),
    /// 400
    BadRequest(String),
    /// 413
    PayloadTooLarge,
    /// 502; the detail is logged, not returned
    BadGateway,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized { challenge, reason } => {
                let mut response = (StatusCode::UNAUTHORIZED, reason).into_response();
                if let Some(url) = challenge {
                    let value = format!("Bearer resource_metadata=\"{url}\"");
                    if let Ok(value) = HeaderValue::from_str(&value) {
                        let headers = response.headers_mut();
                        headers.insert(header::WWW_AUTHENTICATE, value);
                        headers.insert(
                            header::ACCESS_CONTROL_EXPOSE_HEADERS,
                            HeaderValue::from_static("WWW-Authenticate"),
                        );
                    }
                }
                response
            }
            Self::Forbidden(reason) => (StatusCode::FORBIDDEN, reason).into_response(),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            Self::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
            }
            Self::BadGateway => (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_with_challenge_points_at_metadata() {
        let response = Rejection::Unauthorized {
            challenge: Some("https://mcp.example.com/.well-known/oauth-protected-resource".into()),
            reason: "missing Authorization header".into(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS],
            "WWW-Authenticate"
        );
    }

    #[test]
    fn legacy_unauthorized_is_bare() {
        let response = Rejection::Unauthorized {
            challenge: None,
            reason: "x".into(),
        }
        .into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            Rejection::Forbidden("no".into()).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Rejection::BadRequest("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Rejection::BadGateway.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
