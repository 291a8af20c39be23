use crate::error::Error;
use crate::schemas;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

static AUTHENTICATION_API_BASE: &str = "https://api.authentication.husqvarnagroup.dev/v1";
const DEFAULT_PROVIDER: &str = "husqvarna";
const TOKEN_EXPIRATION_HEADROOM: Duration = Duration::new(30, 0);

/// A bearer credential issued by the authentication service.
#[derive(Debug, Clone)]
pub(crate) struct AccessToken {
    value: Arc<str>,
    provider: Arc<str>,
    expires_at: boot_time::Instant,
}

impl AccessToken {
    pub(crate) fn new(value: &str, provider: &str, lifetime: Duration) -> Result<Self, Error> {
        let expires_at = boot_time::Instant::now()
            .checked_add(lifetime)
            .ok_or(Error::TokenLifetime(lifetime))?;
        Ok(Self {
            value: value.into(),
            provider: provider.into(),
            expires_at,
        })
    }

    pub(crate) fn value(&self) -> &str {
        &self.value
    }

    /// Goes into the `authorization-provider` header.
    pub(crate) fn provider(&self) -> &str {
        &self.provider
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= boot_time::Instant::now()
    }
}

#[async_trait::async_trait]
pub(crate) trait Authenticator: Send + Sync {
    /// Exchange the stored credentials for a new token.
    async fn login(&self) -> Result<AccessToken, Error>;
    /// Release the token with the backend.
    async fn logout(&self, token: &AccessToken) -> Result<(), Error>;
}

pub(crate) enum Credentials {
    ClientCredentials { app_secret: String },
    Password { username: String, password: String },
}

pub(crate) struct HusqvarnaAuthenticator {
    client: reqwest::Client,
    app_key: String,
    credentials: Credentials,
}

impl HusqvarnaAuthenticator {
    pub(crate) fn new(client: reqwest::Client, app_key: String, credentials: Credentials) -> Self {
        Self {
            client,
            app_key,
            credentials,
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for HusqvarnaAuthenticator {
    async fn login(&self) -> Result<AccessToken, Error> {
        let form: Vec<(&str, &str)> = match &self.credentials {
            Credentials::ClientCredentials { app_secret } => vec![
                ("grant_type", "client_credentials"),
                ("client_id", self.app_key.as_str()),
                ("client_secret", app_secret.as_str()),
            ],
            Credentials::Password { username, password } => vec![
                ("grant_type", "password"),
                ("client_id", self.app_key.as_str()),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ],
        };
        let response = self
            .client
            .post(format!("{AUTHENTICATION_API_BASE}/oauth2/token"))
            .header("accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(Error::Login)?;
        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED
        {
            return Err(Error::NotAuthorized("POST /oauth2/token"));
        }
        let response = response
            .error_for_status()
            .map_err(Error::Login)?
            .json::<schemas::oauth::TokenResponse>()
            .await
            .map_err(Error::ReadToken)?;
        let lifetime = Duration::try_from_secs_f32(response.expires_in)
            .unwrap_or(Duration::ZERO)
            .saturating_sub(TOKEN_EXPIRATION_HEADROOM);
        let provider = response.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
        tracing::debug!(?lifetime, provider, "obtained an access token");
        AccessToken::new(&response.access_token, provider, lifetime)
    }

    async fn logout(&self, token: &AccessToken) -> Result<(), Error> {
        self.client
            .delete(format!("{AUTHENTICATION_API_BASE}/token/{}", token.value()))
            .header("x-api-key", &self.app_key)
            .header("authorization-provider", token.provider())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(Error::Logout)?;
        Ok(())
    }
}

/// Owns the cached access token. Everybody else only ever sees clones of it.
pub(crate) struct AccessTokenManager {
    authenticator: Arc<dyn Authenticator>,
    token: Mutex<Option<AccessToken>>,
}

impl AccessTokenManager {
    pub(crate) fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            token: Mutex::new(None),
        }
    }

    /// Return the cached token, logging in first if there is none or it has expired.
    pub(crate) async fn current_token(&self) -> Result<AccessToken, Error> {
        // The lock is held across the login so concurrent callers share one login.
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.clone());
        }
        let token = self.authenticator.login().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Discard the cached token so that the next caller logs in again.
    pub(crate) async fn flag_as_invalid(&self) {
        if self.token.lock().await.take().is_some() {
            tracing::info!("access token flagged as invalid");
        }
    }

    pub(crate) async fn logout(&self) -> Result<(), Error> {
        let Some(token) = self.token.lock().await.take() else {
            return Ok(());
        };
        self.authenticator.logout(&token).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Issues `token-1`, `token-2`, … and records what happened to them.
    #[derive(Default)]
    pub(crate) struct FakeAuthenticator {
        pub(crate) logins: AtomicUsize,
        pub(crate) logouts: AtomicUsize,
        pub(crate) reject: AtomicBool,
        pub(crate) lifetime: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl Authenticator for FakeAuthenticator {
        async fn login(&self) -> Result<AccessToken, Error> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(Error::NotAuthorized("POST /oauth2/token"));
            }
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            let lifetime = self.lifetime.unwrap_or(Duration::from_secs(3600));
            AccessToken::new(&format!("token-{n}"), "husqvarna", lifetime)
        }

        async fn logout(&self, _: &AccessToken) -> Result<(), Error> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(authenticator: &Arc<FakeAuthenticator>) -> AccessTokenManager {
        AccessTokenManager::new(Arc::clone(authenticator) as Arc<dyn Authenticator>)
    }

    #[tokio::test]
    async fn logs_in_once_and_caches() {
        let authenticator = Arc::new(FakeAuthenticator::default());
        let tokens = manager(&authenticator);
        assert_eq!(tokens.current_token().await.unwrap().value(), "token-1");
        assert_eq!(tokens.current_token().await.unwrap().value(), "token-1");
        assert_eq!(authenticator.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidated_token_forces_login() {
        let authenticator = Arc::new(FakeAuthenticator::default());
        let tokens = manager(&authenticator);
        tokens.current_token().await.unwrap();
        tokens.flag_as_invalid().await;
        let token = tokens.current_token().await.unwrap();
        assert_eq!(token.value(), "token-2");
        assert_eq!(token.provider(), "husqvarna");
    }

    #[tokio::test]
    async fn expired_token_forces_login() {
        let authenticator = Arc::new(FakeAuthenticator {
            lifetime: Some(Duration::ZERO),
            ..Default::default()
        });
        let tokens = manager(&authenticator);
        tokens.current_token().await.unwrap();
        tokens.current_token().await.unwrap();
        assert_eq!(authenticator.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn login_failure_propagates() {
        let authenticator = Arc::new(FakeAuthenticator::default());
        authenticator.reject.store(true, Ordering::SeqCst);
        let tokens = manager(&authenticator);
        let error = tokens.current_token().await.unwrap_err();
        assert!(error.is_not_authorized());
    }

    #[tokio::test]
    async fn logout_releases_and_clears() {
        let authenticator = Arc::new(FakeAuthenticator::default());
        let tokens = manager(&authenticator);
        tokens.logout().await.unwrap();
        assert_eq!(authenticator.logouts.load(Ordering::SeqCst), 0);
        tokens.current_token().await.unwrap();
        tokens.logout().await.unwrap();
        assert_eq!(authenticator.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.current_token().await.unwrap().value(), "token-2");
    }
}
