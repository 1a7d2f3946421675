//! Middleware that authenticates outgoing requests and renews expired sessions
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthMiddleware`] in the middleware stack to attach the
//! session's current access token to each outbound request as a bearer
//! credential.
//!
//! If the server answers `401 Unauthorized` to a request carrying the session's
//! token, the middleware asks the session's
//! [`RefreshCoordinator`](reauth_session::RefreshCoordinator) for a new token
//! and sends the request again, once, with that token. Any number of requests
//! failing together share a single refresh. The replayed response is returned
//! to the caller whatever its status, and is marked with [`Replayed`].
//!
//! If the refresh fails, the session is logged out and the request fails with an
//! [`AuthError::RenewalFailed`], which [`auth_error`] extracts from the
//! middleware error.
//!
//! ```no_run
//! use reauth_reqwest::AuthMiddleware;
//! use reauth_session::{sources::RefreshEndpoint, RefreshCoordinator, SessionStore};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let store = SessionStore::new();
//!
//! // The refresh endpoint gets a plain client, without the middleware
//! let endpoint = RefreshEndpoint::new(
//!     Client::new(),
//!     "https://example.com/auth/refresh".parse().unwrap(),
//! );
//! let coordinator = RefreshCoordinator::new(endpoint, store);
//!
//! let client = ClientBuilder::new(Client::new())
//!     .with(AuthMiddleware::new(coordinator))
//!     .build();
//!
//! let resp = client
//!     .get("https://example.com/books")
//!     .send()
//!     .await;
//! # drop(resp);
//! # }
//! ```
//!
//! By default the token is attached to every request. A predicate can restrict
//! it to particular backends; predicates compose with
//! [`PredicateBooleanExt`](predicates::prelude::PredicateBooleanExt).
//!
//! ```
//! use predicates::prelude::PredicateBooleanExt;
//! use reauth_reqwest::{AuthMiddleware, ExactHostMatch, HttpsOnly};
//! # use reauth_session::{sources::RefreshEndpoint, RefreshCoordinator, SessionStore};
//! # let endpoint = RefreshEndpoint::new(reqwest::Client::new(), "https://example.com/auth/refresh".parse().unwrap());
//! # let coordinator = RefreshCoordinator::new(endpoint, SessionStore::new());
//!
//! AuthMiddleware::new(coordinator)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use predicates::{constant::BooleanPredicate, Predicate};
use reauth_session::{
    sources::RefreshSource, AccessTokenRef, RefreshCoordinator, RefreshError, Session,
};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Error, Middleware, Next, Result};
use thiserror::Error;

mod disposition;
mod predicate;

use disposition::{Credential, Disposition, Exchange, RequestAttempt};
pub use disposition::FailureKind;
pub use predicate::{ExactHostMatch, HttpsOnly};

/// Marks a response as the answer to a request replayed after renewing the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Replayed;

/// An error raised by the middleware itself
#[derive(Debug, Error)]
pub enum AuthError {
    /// The session the request was sent under could not be renewed and has ended
    #[error("session could not be renewed")]
    RenewalFailed(#[source] Arc<RefreshError>),
    /// The access token contains bytes that are not allowed in a header
    #[error("access token is not a valid header value")]
    InvalidToken(#[source] header::InvalidHeaderValue),
}

/// Extracts the middleware's own error from a request error, if that is what it is
pub fn auth_error(error: &Error) -> Option<&AuthError> {
    match error {
        Error::Middleware(inner) => inner.downcast_ref(),
        _ => None,
    }
}

/// A middleware that authenticates requests with the session's access token
/// and renews the session when the token is rejected
pub struct AuthMiddleware<S, P = BooleanPredicate> {
    coordinator: RefreshCoordinator<S>,
    predicate: P,
}

impl<S, P: Clone> Clone for AuthMiddleware<S, P> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S, P: fmt::Debug> fmt::Debug for AuthMiddleware<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMiddleware")
            .field("coordinator", &self.coordinator)
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl<S> AuthMiddleware<S> {
    /// Construct a new middleware from a refresh coordinator
    ///
    /// The session's token is attached to every request. To restrict which
    /// requests receive it, provide a predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(coordinator: RefreshCoordinator<S>) -> Self {
        Self {
            coordinator,
            predicate: predicates::constant::always(),
        }
    }
}

impl<S, P> AuthMiddleware<S, P> {
    /// Replaces the attachment predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AuthMiddleware<S, Q> {
        AuthMiddleware {
            coordinator: self.coordinator,
            predicate,
        }
    }
}

impl<S, P> AuthMiddleware<S, P>
where
    P: Predicate<Request>,
{
    /// Attaches the session's access token, reporting how the request ended up
    /// credentialed along with the snapshot whose token was attached
    fn authorize(
        &self,
        req: &mut Request,
    ) -> std::result::Result<(Credential, Option<Arc<Session>>), AuthError> {
        if !self.predicate.eval(req) {
            return Ok((Credential::Excluded, None));
        }

        if req.headers().contains_key(header::AUTHORIZATION) {
            return Ok((Credential::Caller, None));
        }

        let session = self.coordinator.store().session();
        let Some(token) = session.access_token() else {
            return Ok((Credential::Anonymous, None));
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                token = format_args!("{:#?}", token),
                url = %req.url(),
                "attaching access token"
            );
        }

        req.headers_mut()
            .insert(header::AUTHORIZATION, bearer_header(token)?);
        Ok((Credential::Session, Some(session)))
    }

    fn logged_in(&self) -> bool {
        self.coordinator.store().is_logged()
    }
}

impl<S, P> AuthMiddleware<S, P>
where
    S: RefreshSource,
    P: Predicate<Request>,
{
    /// Replays a request whose credential was rejected
    ///
    /// `attached` is the snapshot whose token the rejected request carried, if
    /// it carried one at all.
    async fn renew_and_replay(
        &self,
        mut req: Request,
        attached: Option<&Session>,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        tracing::debug!(
            method = %req.method(),
            url = %req.url(),
            "access token rejected, renewing session"
        );

        let renewed = match attached {
            Some(session) => self.coordinator.renew(session).await,
            None => self.coordinator.refresh().await,
        };
        let token =
            renewed.map_err(|error| Error::middleware(AuthError::RenewalFailed(error)))?;

        let value = bearer_header(&token).map_err(Error::middleware)?;
        req.headers_mut().insert(header::AUTHORIZATION, value);

        let response = next.run(req, extensions).await?;
        let exchange = Exchange {
            status: response.status(),
            attempt: RequestAttempt::Replay,
            credential: Credential::Session,
            replayable: false,
            logged_in: self.logged_in(),
        };

        let mut response = conclude(response, exchange.disposition());
        response.extensions_mut().insert(Replayed);
        Ok(response)
    }
}

#[async_trait::async_trait]
impl<S, P> Middleware for AuthMiddleware<S, P>
where
    S: RefreshSource,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let (credential, attached) = self.authorize(&mut req).map_err(Error::middleware)?;

        let replay = match credential {
            Credential::Session | Credential::Anonymous => req.try_clone(),
            Credential::Caller | Credential::Excluded => None,
        };

        let response = next.clone().run(req, extensions).await?;
        let exchange = Exchange {
            status: response.status(),
            attempt: RequestAttempt::Initial,
            credential,
            replayable: replay.is_some(),
            logged_in: self.logged_in(),
        };

        match (exchange.disposition(), replay) {
            (Disposition::Renew, Some(replay)) => {
                self.renew_and_replay(replay, attached.as_deref(), extensions, next)
                    .await
            }
            (disposition, _) => Ok(conclude(response, disposition)),
        }
    }
}

/// Records why a failed response is being handed back as-is
fn conclude(mut response: Response, disposition: Disposition) -> Response {
    if let Disposition::PassThrough(kind) = disposition {
        if kind == FailureKind::NotReplayable {
            tracing::warn!(
                url = %response.url(),
                "request body cannot be replayed, returning authentication failure"
            );
        } else {
            tracing::trace!(
                ?kind,
                status = response.status().as_u16(),
                "passing failure through"
            );
        }
        response.extensions_mut().insert(kind);
    }
    response
}

fn bearer_header(token: &AccessTokenRef) -> std::result::Result<header::HeaderValue, AuthError> {
    let mut buf = BytesMut::with_capacity(token.as_str().len() + 7);
    buf.put_slice(b"Bearer ");
    buf.put_slice(token.as_str().as_bytes());

    let mut value =
        header::HeaderValue::from_maybe_shared(buf.freeze()).map_err(AuthError::InvalidToken)?;
    value.set_sensitive(true);
    Ok(value)
}
