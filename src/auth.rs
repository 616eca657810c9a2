//! Session verification against the CTF front-end.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::{redirect, StatusCode};
use tracing::{debug, warn};

use crate::error::AuthError;

/// Outcome of checking a caller credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    Authenticated { owner: String },
    Unauthenticated,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<AuthStatus, AuthError>;
}

/// Asks the front-end whether the caller's cookie belongs to a logged-in user.
///
/// The front-end answers `200` on its user page for a valid session and
/// redirects to the login page otherwise, so redirects are not followed.
pub struct HttpAuthenticator {
    client: reqwest::Client,
    user_url: String,
}

impl HttpAuthenticator {
    pub fn new(user_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            user_url: user_url.into(),
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<AuthStatus, AuthError> {
        let Some(owner) = session_id(credential) else {
            return Ok(AuthStatus::Unauthenticated);
        };

        let resp = self
            .client
            .get(&self.user_url)
            .header(COOKIE, credential)
            .header(USER_AGENT, "ctf-manager")
            .send()
            .await?;

        debug!(status = %resp.status(), "auth service answered");
        if resp.status() == StatusCode::OK {
            Ok(AuthStatus::Authenticated { owner })
        } else {
            if resp.status().is_server_error() {
                warn!(status = %resp.status(), "auth service error");
            }
            Ok(AuthStatus::Unauthenticated)
        }
    }
}

/// Owner identity carried by a cookie header: the value of its first pair.
pub fn session_id(cookie: &str) -> Option<String> {
    let first = cookie.split(';').next()?.trim();
    let (_, value) = first.split_once('=')?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
