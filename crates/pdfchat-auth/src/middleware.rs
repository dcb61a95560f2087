use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use pdfchat_error::PdfChatError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::auth::{AsyncAuthorizeRequest, AsyncRequireAuthorizationLayer};
use tracing::debug;

use crate::jwt::JwtService;

/// Cookie carrying the session token when no Authorization header is sent.
pub const SESSION_COOKIE: &str = "__session";

/// Authenticated caller, inserted into request extensions by [`RequireUser`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
}

/// Finds the session token: `Authorization: Bearer` first, then the session cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = JwtService::extract_token_from_header(auth) {
            return Some(token.to_string());
        }
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookies| cookie_value(cookies, SESSION_COOKIE))
}

fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name && !v.is_empty()).then(|| v.to_string())
    })
}

/// Rejects requests without a valid session token.
#[derive(Clone)]
pub struct RequireUser {
    jwt: Arc<JwtService>,
}

impl RequireUser {
    pub fn layer(jwt: Arc<JwtService>) -> AsyncRequireAuthorizationLayer<Self> {
        AsyncRequireAuthorizationLayer::new(Self { jwt })
    }
}

impl<B> AsyncAuthorizeRequest<B> for RequireUser
where
    B: Send + 'static,
{
    type RequestBody = B;
    type ResponseBody = axum::body::Body;
    type Future = std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = std::result::Result<Request<B>, Response<Self::ResponseBody>>,
                > + Send,
        >,
    >;

    fn authorize(&mut self, request: Request<B>) -> Self::Future {
        let jwt = self.jwt.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let Some(token) = token_from_headers(&parts.headers) else {
                return Err(PdfChatError::Authentication {
                    message: "missing session token".to_string(),
                }
                .into_response());
            };
            match jwt.verify(&token) {
                Ok(claims) => {
                    let mut request = Request::from_parts(parts, body);
                    request.extensions_mut().insert(AuthUser {
                        user_id: claims.sub,
                    });
                    Ok(request)
                }
                Err(e) => {
                    debug!(error = %e, path = %parts.uri.path(), "rejected session token");
                    Err(e.into_response())
                }
            }
        })
    }
}

/// Operator credentials for the admin routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminCredentials {
    pub user: String,
    pub pass: String,
    #[serde(default)]
    pub bearer: Option<String>,
}

/// Basic `user:pass` or a static bearer token.
pub fn admin_auth_ok(headers: &HeaderMap, creds: &AdminCredentials) -> bool {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(b64) = auth.strip_prefix("Basic ") {
        if creds.user.is_empty() || creds.pass.is_empty() {
            return false;
        }
        let engine = base64::engine::general_purpose::STANDARD;
        return engine
            .decode(b64.trim())
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .map(|s| s == format!("{}:{}", creds.user, creds.pass))
            .unwrap_or(false);
    }

    if let Some(token) = auth.strip_prefix("Bearer ") {
        return creds
            .bearer
            .as_deref()
            .map(|expected| !expected.is_empty() && token.trim() == expected)
            .unwrap_or(false);
    }
    false
}

#[derive(Clone)]
pub struct RequireAdmin {
    creds: Arc<AdminCredentials>,
}

impl RequireAdmin {
    pub fn layer(creds: AdminCredentials) -> AsyncRequireAuthorizationLayer<Self> {
        AsyncRequireAuthorizationLayer::new(Self {
            creds: Arc::new(creds),
        })
    }
}

impl<B> AsyncAuthorizeRequest<B> for RequireAdmin
where
    B: Send + 'static,
{
    type RequestBody = B;
    type ResponseBody = axum::body::Body;
    type Future = std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = std::result::Result<Request<B>, Response<Self::ResponseBody>>,
                > + Send,
        >,
    >;

    fn authorize(&mut self, request: Request<B>) -> Self::Future {
        let creds = self.creds.clone();
        Box::pin(async move {
            if admin_auth_ok(request.headers(), &creds) {
                Ok(request)
            } else {
                Err((StatusCode::UNAUTHORIZED, "unauthorized").into_response())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(k.clone(), HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_token_prefers_bearer_header() {
        let h = headers(&[
            (header::AUTHORIZATION, "Bearer from-header"),
            (header::COOKIE, "__session=from-cookie"),
        ]);
        assert_eq!(token_from_headers(&h).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_token_from_session_cookie() {
        let h = headers(&[(header::COOKIE, "theme=dark; __session=abc.def.ghi; other=1")]);
        assert_eq!(token_from_headers(&h).as_deref(), Some("abc.def.ghi"));
        let h = headers(&[(header::COOKIE, "__session_other=x")]);
        assert_eq!(token_from_headers(&h), None);
    }

    #[test]
    fn test_admin_basic_and_bearer() {
        let creds = AdminCredentials {
            user: "admin".into(),
            pass: "s3cret".into(),
            bearer: Some("tok".into()),
        };
        let basic = base64::engine::general_purpose::STANDARD.encode("admin:s3cret");
        assert!(admin_auth_ok(
            &headers(&[(header::AUTHORIZATION, &format!("Basic {}", basic))]),
            &creds
        ));
        assert!(admin_auth_ok(
            &headers(&[(header::AUTHORIZATION, "Bearer tok")]),
            &creds
        ));
        assert!(!admin_auth_ok(
            &headers(&[(header::AUTHORIZATION, "Bearer nope")]),
            &creds
        ));
        assert!(!admin_auth_ok(&HeaderMap::new(), &creds));

        let no_bearer = AdminCredentials {
            bearer: None,
            ..creds
        };
        assert!(!admin_auth_ok(
            &headers(&[(header::AUTHORIZATION, "Bearer tok")]),
            &no_bearer
        ));
    }
}
