//! Token verification and the request extractors built on it.
//!
//! Tokens are HS256 JWTs with an `aud` claim naming one or more audiences
//! (`tasks-api`, `clients-api`, `admin`). How tokens are minted is an
//! external concern (OAuth2/OIDC); this module owns verification and the
//! local issuer used by the bundled client and the tests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use waldiez_runner_model::Audience;

use crate::error::ApiError;
use crate::state::AppState;

const TOKEN_TTL_SECS: i64 = 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Verify signature, expiry and that the token carries one of the
    /// expected audiences. Returns the client id and the audience matched.
    pub fn verify(
        &self,
        token: &str,
        expected: &[Audience],
    ) -> Result<(String, Audience), ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(
            &expected.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
        );
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| ApiError::unauthorized())?;
        let audience = data
            .claims
            .aud
            .iter()
            .filter_map(|aud| aud.parse::<Audience>().ok())
            .find(|aud| expected.contains(aud))
            .ok_or_else(ApiError::unauthorized)?;
        Ok((data.claims.sub, audience))
    }

    /// Mint a token for the given client id and audiences.
    pub fn issue(
        &self,
        client_id: &str,
        audiences: &[Audience],
    ) -> Result<String, ApiError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: client_id.to_string(),
            aud: audiences.iter().map(|a| a.as_str().to_string()).collect(),
            exp: now + TOKEN_TTL_SECS,
            iat: now,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| ApiError::internal("failed to issue token"))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token.trim())
}

/// An authenticated client with the `tasks-api` audience.
#[derive(Debug, Clone)]
pub struct TasksApiClient {
    pub client_id: String,
}

impl FromRequestParts<AppState> for TasksApiClient {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(ApiError::unauthorized)?;
        let (client_id, _) = state
            .verifier
            .verify(token, &[Audience::TasksApi])?;
        Ok(Self { client_id })
    }
}

/// An authenticated client that may also hold the `admin` audience; admin
/// holders see and manage every client's tasks.
#[derive(Debug, Clone)]
pub struct MaybeAdminClient {
    pub client_id: String,
    pub is_admin: bool,
}

impl FromRequestParts<AppState> for MaybeAdminClient {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(ApiError::unauthorized)?;
        let (client_id, audience) = state
            .verifier
            .verify(token, &[Audience::TasksApi, Audience::Admin])?;
        Ok(Self {
            client_id,
            is_admin: audience == Audience::Admin,
        })
    }
}

/// An authenticated admin; everyone else gets 403.
#[derive(Debug, Clone)]
pub struct AdminClient {
    pub client_id: String,
}

impl FromRequestParts<AppState> for AdminClient {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(ApiError::unauthorized)?;
        match state.verifier.verify(token, &[Audience::Admin]) {
            Ok((client_id, _)) => Ok(Self { client_id }),
            Err(_) => {
                // Distinguish a valid non-admin token (403) from garbage
                // (401).
                if state
                    .verifier
                    .verify(
                        token,
                        &[Audience::TasksApi, Audience::ClientsApi],
                    )
                    .is_ok()
                {
                    Err(ApiError::forbidden())
                } else {
                    Err(ApiError::unauthorized())
                }
            }
        }
    }
}

/// Token extraction for the WebSocket handshake, in priority order: query
/// parameter, cookie, bearer header, `tasks-api, <token>` subprotocol.
/// The second element says whether the subprotocol form was used, so the
/// handshake can echo `tasks-api` back.
pub fn ws_token(
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Option<(String, bool)> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some((token.to_string(), false));
    }
    if let Some(token) = cookie_token(headers) {
        return Some((token, false));
    }
    if let Some(token) = bearer_token(headers) {
        return Some((token.to_string(), false));
    }
    if let Some(token) = subprotocol_token(headers) {
        return Some((token, true));
    }
    None
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        if name == "access_token" && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn subprotocol_token(headers: &HeaderMap) -> Option<String> {
    let protocols = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)?
        .to_str()
        .ok()?;
    let mut parts = protocols.split(',');
    let first = parts.next()?.trim();
    let second = parts.next()?.trim();
    if parts.next().is_some() {
        return None;
    }
    if !first.eq_ignore_ascii_case(Audience::TasksApi.as_str()) {
        return None;
    }
    Some(second.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("test-secret")
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let verifier = verifier();
        let token =
            verifier.issue("client-1", &[Audience::TasksApi]).unwrap();
        let (client_id, audience) =
            verifier.verify(&token, &[Audience::TasksApi]).unwrap();
        assert_eq!(client_id, "client-1");
        assert_eq!(audience, Audience::TasksApi);
    }

    #[test]
    fn audience_mismatch_is_rejected() {
        let verifier = verifier();
        let token =
            verifier.issue("client-1", &[Audience::TasksApi]).unwrap();
        assert!(verifier.verify(&token, &[Audience::Admin]).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = verifier()
            .issue("client-1", &[Audience::TasksApi])
            .unwrap();
        let other = TokenVerifier::new("other-secret");
        assert!(other.verify(&token, &[Audience::TasksApi]).is_err());
    }

    #[test]
    fn ws_token_priority_order() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("access_token=from-cookie"),
        );
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("tasks-api, from-subprotocol"),
        );

        // Query parameter wins.
        let (token, sub) = ws_token(Some("from-query"), &headers).unwrap();
        assert_eq!(token, "from-query");
        assert!(!sub);

        // Then the cookie.
        let (token, _) = ws_token(None, &headers).unwrap();
        assert_eq!(token, "from-cookie");

        // Then the bearer header.
        headers.remove(header::COOKIE);
        let (token, _) = ws_token(None, &headers).unwrap();
        assert_eq!(token, "from-header");

        // Finally the subprotocol pair, flagged for the echo.
        headers.remove(header::AUTHORIZATION);
        let (token, sub) = ws_token(None, &headers).unwrap();
        assert_eq!(token, "from-subprotocol");
        assert!(sub);

        headers.remove(header::SEC_WEBSOCKET_PROTOCOL);
        assert!(ws_token(None, &headers).is_none());
    }

    #[test]
    fn subprotocol_must_name_tasks_api() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("other-api, token"),
        );
        assert!(ws_token(None, &headers).is_none());
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("tasks-api"),
        );
        assert!(ws_token(None, &headers).is_none());
    }
}
