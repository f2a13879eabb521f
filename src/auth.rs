// =============================================================================
// REQUESTER IDENTITY
// =============================================================================
// Two kinds of callers:
// - Buyers, identified by the upstream auth provider through the `x-user-id`
//   header (stable subject id)
// - Admins, holding an `admin_session` cookie with an opaque random token.
//   Tokens are checked by format only (64 hex chars); logging out deletes the
//   cookie and there is no server-side revocation list.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use rand::RngCore;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::AdminLoginRequest;

pub const BUYER_HEADER: &str = "x-user-id";
pub const ADMIN_SESSION_COOKIE: &str = "admin_session";

const MAX_BUYER_ID_LEN: usize = 255;

// =============================================================================
// BUYER
// =============================================================================

/// Authenticated buyer; rejects with 401 when the header is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buyer(pub String);

impl Buyer {
    pub fn id(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Buyer
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(BUYER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= MAX_BUYER_ID_LEN)
            .map(|id| Buyer(id.to_string()))
            .ok_or_else(|| AppError::Unauthorized("Unauthorized".to_string()))
    }
}

/// Like [`Buyer`] but never rejects; anonymous callers yield `None`.
#[derive(Debug, Clone)]
pub struct MaybeBuyer(pub Option<Buyer>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeBuyer
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeBuyer(Buyer::from_request_parts(parts, state).await.ok()))
    }
}

// =============================================================================
// ADMIN SESSION
// =============================================================================

pub fn is_valid_token(token: &str) -> bool {
    token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Present on requests carrying a well-formed admin session cookie.
#[derive(Debug, Clone)]
pub struct AdminSession;

#[async_trait]
impl<S> FromRequestParts<S> for AdminSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        match jar.get(ADMIN_SESSION_COOKIE) {
            Some(cookie) if is_valid_token(cookie.value()) => Ok(AdminSession),
            _ => Err(AppError::Unauthorized("Admin session required".to_string())),
        }
    }
}

/// Admin credential check and session cookie handling.
#[derive(Clone)]
pub struct AdminAuth {
    username: Option<String>,
    password: Option<String>,
    secure_cookie: bool,
}

impl AdminAuth {
    pub fn new(username: Option<String>, password: Option<String>, secure_cookie: bool) -> Self {
        Self {
            username,
            password,
            secure_cookie,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.admin_username.clone(),
            config.admin_password.clone(),
            config.environment.is_production(),
        )
    }

    /// Verify credentials and add a fresh session cookie to `jar`.
    pub fn login(&self, jar: CookieJar, request: &AdminLoginRequest) -> AppResult<CookieJar> {
        if request.username.is_empty() || request.password.is_empty() {
            return Err(AppError::Validation(
                "Username and password are required".to_string(),
            ));
        }

        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            tracing::warn!("Admin login attempted but no admin credentials are configured");
            return Err(AppError::Unauthorized("Invalid username or password".to_string()));
        };
        if request.username != *username || request.password != *password {
            tracing::warn!(username = %request.username, "Admin login rejected");
            return Err(AppError::Unauthorized("Invalid username or password".to_string()));
        }

        let cookie = Cookie::build((ADMIN_SESSION_COOKIE, generate_token()))
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure_cookie)
            .path("/");
        tracing::info!(username = %request.username, "Admin logged in");
        Ok(jar.add(cookie))
    }

    pub fn logout(&self, jar: CookieJar) -> CookieJar {
        jar.remove(Cookie::build((ADMIN_SESSION_COOKIE, "")).path("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, Request};

    fn parts(name: &str, value: &str) -> Parts {
        let (parts, _) = Request::builder()
            .header(name, value)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn login_request(username: &str, password: &str) -> AdminLoginRequest {
        AdminLoginRequest {
            username: username.into(),
            password: password.into(),
        }
    }

    #[test]
    fn tokens_are_64_hex_chars() {
        let token = generate_token();
        assert!(is_valid_token(&token));
        assert_ne!(token, generate_token());
        assert!(!is_valid_token("abc"));
        assert!(!is_valid_token(&"g".repeat(64)));
    }

    #[tokio::test]
    async fn buyer_comes_from_the_auth_header() {
        let mut with = parts(BUYER_HEADER, "user_42");
        let buyer = Buyer::from_request_parts(&mut with, &()).await.unwrap();
        assert_eq!(buyer.id(), "user_42");

        let mut blank = parts(BUYER_HEADER, "  ");
        let err = Buyer::from_request_parts(&mut blank, &()).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let mut anonymous = parts("x-other", "1");
        let MaybeBuyer(none) = MaybeBuyer::from_request_parts(&mut anonymous, &()).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn admin_session_checks_cookie_format() {
        let cookie = format!("{}={}", ADMIN_SESSION_COOKIE, generate_token());
        let mut ok = parts(header::COOKIE.as_str(), &cookie);
        assert!(AdminSession::from_request_parts(&mut ok, &()).await.is_ok());

        let mut bad = parts(header::COOKIE.as_str(), "admin_session=short");
        assert!(AdminSession::from_request_parts(&mut bad, &()).await.is_err());
    }

    #[test]
    fn login_requires_configured_credentials() {
        let auth = AdminAuth::new(Some("admin".into()), Some("hunter2".into()), false);

        let jar = auth.login(CookieJar::new(), &login_request("admin", "hunter2")).unwrap();
        let token = jar.get(ADMIN_SESSION_COOKIE).unwrap().value().to_string();
        assert!(is_valid_token(&token));

        assert!(matches!(
            auth.login(CookieJar::new(), &login_request("admin", "wrong")),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.login(CookieJar::new(), &login_request("", "")),
            Err(AppError::Validation(_))
        ));

        let unconfigured = AdminAuth::new(None, None, false);
        assert!(unconfigured
            .login(CookieJar::new(), &login_request("admin", "hunter2"))
            .is_err());

        let jar = auth.logout(jar);
        assert!(jar.get(ADMIN_SESSION_COOKIE).is_none());
    }
}
