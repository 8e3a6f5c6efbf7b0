//! Client-credentials authentication and the shared credential cache
//!
//! One [`CredentialCache`] is shared by every fetch. It hands out the cached
//! bearer token while it is comfortably inside its lifetime and coordinates
//! refreshes so only one token exchange is ever in flight: concurrent callers
//! park on a condition variable and receive the outcome of that exchange.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::Deserialize;

use super::transport::HttpTransport;
use crate::error::{AuthError, TransportError};

/// Seconds shaved off `expires_in` when a token is issued
pub const ISSUANCE_BUFFER_SECS: i64 = 60;

/// A cached token is only reused while `now < expires_at - REFRESH_SKEW`
pub const REFRESH_SKEW_SECS: i64 = 5 * 60;

/// Bearer credential with its absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Build a credential from a token grant received at `issued_at`
    pub fn from_grant(grant: &TokenGrant, issued_at: DateTime<Utc>) -> Self {
        let lifetime = (grant.expires_in - ISSUANCE_BUFFER_SECS).max(0);
        Self::new(
            grant.access_token.clone(),
            issued_at + Duration::seconds(lifetime),
        )
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the credential may still be handed out at `now`
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::seconds(REFRESH_SKEW_SECS)
    }
}

/// Token response from the client-credentials endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
}

/// Something that can exchange client credentials for a token
pub trait TokenSource: Send + Sync {
    fn exchange(&self) -> Result<TokenGrant, AuthError>;
}

/// Client-credentials grant against the tenant's token endpoint
pub struct ClientCredentialsExchange {
    token_url: String,
    client_id: String,
    client_secret: String,
    transport: Box<dyn HttpTransport>,
}

impl ClientCredentialsExchange {
    /// Create an exchange that posts to `token_url` over `transport`.
    ///
    /// The transport should carry the (shorter) exchange timeout.
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        transport: Box<dyn HttpTransport>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            transport,
        }
    }
}

impl TokenSource for ClientCredentialsExchange {
    fn exchange(&self) -> Result<TokenGrant, AuthError> {
        let reply = self
            .transport
            .post_form(
                &self.token_url,
                &[
                    ("grant_type", "client_credentials"),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                ],
            )
            .map_err(|e| match e {
                TransportError::Timeout => AuthError::Timeout,
                TransportError::Io(msg) => AuthError::Transport(msg),
            })?;

        if !reply.is_success() {
            return Err(AuthError::Rejected {
                status: reply.status,
                body: reply.body,
            });
        }

        serde_json::from_str(&reply.body).map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }
}

#[derive(Default)]
struct CacheState {
    credential: Option<Credential>,
    refreshing: bool,
    /// Bumped every time a refresh completes
    generation: u64,
    last_outcome: Option<Result<Credential, AuthError>>,
    exchanges: u64,
}

/// Process-wide credential cache with single-flight refresh
pub struct CredentialCache {
    source: Box<dyn TokenSource>,
    state: Mutex<CacheState>,
    refreshed: Condvar,
}

impl CredentialCache {
    pub fn new(source: impl TokenSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            state: Mutex::new(CacheState::default()),
            refreshed: Condvar::new(),
        }
    }

    /// Get a usable credential, exchanging for a new one when needed.
    ///
    /// With `force_refresh` the cached credential is ignored. A caller that
    /// arrives while a refresh is in flight waits for it and returns its
    /// outcome instead of starting another exchange.
    pub fn get_credential(&self, force_refresh: bool) -> Result<Credential, AuthError> {
        let mut state = self.lock_state();

        if state.refreshing {
            let generation = state.generation;
            debug!("Waiting for in-flight token refresh");
            while state.generation == generation {
                state = self
                    .refreshed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            return state.last_outcome.clone().unwrap_or(Err(AuthError::Aborted));
        }

        if !force_refresh
            && let Some(credential) = &state.credential
            && credential.is_usable_at(Utc::now())
        {
            return Ok(credential.clone());
        }

        state.refreshing = true;
        drop(state);

        let refresh = RefreshInFlight {
            cache: self,
            completed: false,
        };
        info!("Requesting new access token");
        let outcome = self
            .source
            .exchange()
            .map(|grant| Credential::from_grant(&grant, Utc::now()));
        refresh.complete(outcome.clone());

        match &outcome {
            Ok(credential) => info!("Access token refreshed, expires at {}", credential.expires_at()),
            Err(e) => warn!("Token exchange failed: {}", e),
        }
        outcome
    }

    /// Drop the cached credential so the next caller exchanges again
    pub fn invalidate(&self) {
        self.lock_state().credential = None;
    }

    /// Number of completed token exchanges
    pub fn exchange_count(&self) -> u64 {
        self.lock_state().exchanges
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_refresh(&self, outcome: Result<Credential, AuthError>) {
        let mut state = self.lock_state();
        state.credential = outcome.as_ref().ok().cloned();
        state.refreshing = false;
        state.generation += 1;
        state.exchanges += 1;
        state.last_outcome = Some(outcome);
        drop(state);
        self.refreshed.notify_all();
    }
}

/// Clears the refresh-in-progress flag however the exchange ends,
/// including a panic inside the token source.
struct RefreshInFlight<'a> {
    cache: &'a CredentialCache,
    completed: bool,
}

impl RefreshInFlight<'_> {
    fn complete(mut self, outcome: Result<Credential, AuthError>) {
        self.completed = true;
        self.cache.finish_refresh(outcome);
    }
}

impl Drop for RefreshInFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.cache.finish_refresh(Err(AuthError::Aborted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::HttpReply;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    /// Token source that counts exchanges and hands out numbered tokens
    struct CountingSource {
        calls: Arc<AtomicU32>,
        expires_in: i64,
        delay: std::time::Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(calls: Arc<AtomicU32>) -> Self {
            Self {
                calls,
                expires_in: 3600,
                delay: std::time::Duration::ZERO,
                fail: false,
            }
        }
    }

    impl TokenSource for CountingSource {
        fn exchange(&self) -> Result<TokenGrant, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(self.delay);
            if self.fail {
                return Err(AuthError::Rejected {
                    status: 400,
                    body: "invalid_client".into(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("token-{}", n),
                expires_in: self.expires_in,
            })
        }
    }

    struct PanickingSource;

    impl TokenSource for PanickingSource {
        fn exchange(&self) -> Result<TokenGrant, AuthError> {
            panic!("token source exploded");
        }
    }

    #[test]
    fn test_credential_validity_window() {
        let now = Utc::now();
        let credential = Credential::new("t", now + Duration::minutes(10));
        assert!(credential.is_usable_at(now));
        assert!(!credential.is_usable_at(now + Duration::minutes(6)));
    }

    #[test]
    fn test_grant_applies_issuance_buffer() {
        let now = Utc::now();
        let grant = TokenGrant {
            access_token: "abc".into(),
            expires_in: 900,
        };
        let credential = Credential::from_grant(&grant, now);
        assert_eq!(credential.expires_at(), now + Duration::seconds(840));
    }

    #[test]
    fn test_cached_credential_is_reused() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = CredentialCache::new(CountingSource::new(calls.clone()));

        let first = cache.get_credential(false).unwrap();
        let second = cache.get_credential(false).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_refresh_exchanges_again() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = CredentialCache::new(CountingSource::new(calls.clone()));

        let first = cache.get_credential(false).unwrap();
        let forced = cache.get_credential(true).unwrap();
        assert_ne!(first.token(), forced.token());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_short_lived_token_is_not_reused() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut source = CountingSource::new(calls.clone());
        // 200s - 60s buffer is inside the 5 minute skew
        source.expires_in = 200;
        let cache = CredentialCache::new(source);

        cache.get_credential(false).unwrap();
        cache.get_credential(false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_callers_share_one_exchange() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut source = CountingSource::new(calls.clone());
        source.delay = std::time::Duration::from_millis(100);
        let cache = Arc::new(CredentialCache::new(source));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get_credential(false))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
    }

    #[test]
    fn test_concurrent_callers_share_one_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut source = CountingSource::new(calls.clone());
        source.delay = std::time::Duration::from_millis(100);
        source.fail = true;
        let cache = Arc::new(CredentialCache::new(source));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get_credential(false))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert!(matches!(result, Err(AuthError::Rejected { status: 400, .. })));
        }
    }

    #[test]
    fn test_failure_clears_cache() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut source = CountingSource::new(calls.clone());
        source.fail = true;
        let cache = CredentialCache::new(source);

        assert!(cache.get_credential(false).is_err());
        // Nothing cached: the next call exchanges again instead of waiting
        assert!(cache.get_credential(false).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.exchange_count(), 2);
    }

    #[test]
    fn test_panicking_source_does_not_deadlock() {
        let cache = Arc::new(CredentialCache::new(PanickingSource));

        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_credential(false))
        };
        assert!(worker.join().is_err());

        // The in-flight flag was cleared during unwinding
        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_credential(false))
        };
        assert!(worker.join().is_err());
        assert_eq!(cache.exchange_count(), 2);
    }

    #[test]
    fn test_invalidate_forces_exchange() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = CredentialCache::new(CountingSource::new(calls.clone()));

        cache.get_credential(false).unwrap();
        cache.invalidate();
        cache.get_credential(false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct FormTransport {
        reply: Result<HttpReply, TransportError>,
        seen_form: Mutex<Vec<(String, String)>>,
    }

    impl HttpTransport for FormTransport {
        fn get(
            &self,
            _url: &str,
            _query: &[(String, String)],
            _headers: &[(&str, String)],
        ) -> Result<HttpReply, TransportError> {
            unreachable!("token exchange only posts")
        }

        fn post_form(&self, _url: &str, form: &[(&str, &str)]) -> Result<HttpReply, TransportError> {
            *self.seen_form.lock().unwrap() = form
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.reply.clone()
        }
    }

    fn exchange_with(reply: Result<HttpReply, TransportError>) -> (ClientCredentialsExchange, Arc<FormTransport>) {
        let transport = Arc::new(FormTransport {
            reply,
            seen_form: Mutex::new(Vec::new()),
        });
        let exchange = ClientCredentialsExchange::new(
            "https://auth.example.com/connect/token",
            "client",
            "secret",
            Box::new(transport.clone()),
        );
        (exchange, transport)
    }

    #[test]
    fn test_exchange_posts_client_credentials() {
        let (exchange, transport) = exchange_with(Ok(HttpReply::new(
            200,
            r#"{"access_token":"abc","expires_in":900,"token_type":"Bearer"}"#,
        )));

        let grant = exchange.exchange().unwrap();
        assert_eq!(grant.access_token, "abc");
        assert_eq!(grant.expires_in, 900);

        let form = transport.seen_form.lock().unwrap().clone();
        assert!(form.contains(&("grant_type".into(), "client_credentials".into())));
        assert!(form.contains(&("client_id".into(), "client".into())));
        assert!(form.contains(&("client_secret".into(), "secret".into())));
    }

    #[test]
    fn test_exchange_rejection_and_timeout() {
        let (exchange, _) = exchange_with(Ok(HttpReply::new(401, "bad client")));
        assert_eq!(
            exchange.exchange().unwrap_err(),
            AuthError::Rejected {
                status: 401,
                body: "bad client".into()
            }
        );

        let (exchange, _) = exchange_with(Err(TransportError::Timeout));
        assert_eq!(exchange.exchange().unwrap_err(), AuthError::Timeout);

        let (exchange, _) = exchange_with(Ok(HttpReply::new(200, "not json")));
        assert!(matches!(
            exchange.exchange().unwrap_err(),
            AuthError::InvalidResponse(_)
        ));
    }
}
