//! Session state and single-flight renewal of access tokens
//!
//! This library holds the authenticated session of a client application and
//! renews its access token when the token stops being accepted. It is built
//! around three pieces:
//!
//! * A [`SessionStore`], which owns the current access token, refresh token,
//!   user profile and logged-in flag. Explicit logins and logouts go through
//!   the store, and interested parties can register a [`SessionListener`] or
//!   hold a [`SessionWatcher`] to learn about changes.
//! * A [`RefreshSource`][sources::RefreshSource], which performs the remote
//!   exchange of a refresh token for a new grant. [`RefreshEndpoint`][sources::RefreshEndpoint]
//!   implements this against an HTTP endpoint.
//! * A [`RefreshCoordinator`], which makes sure that no matter how many callers
//!   discover an expired token at the same moment, only one refresh is in flight.
//!   Every caller that arrived during that refresh receives the same outcome.
//!
//! When a refresh fails, whether because the endpoint could not be reached,
//! rejected the refresh token, or answered without an access token, the
//! coordinator logs the session out and notifies listeners before reporting the
//! failure to any caller.
//!
//! ```
//! use reauth_session::{AccessToken, RefreshToken, SessionStore, TokenGrant};
//!
//! let store = SessionStore::new();
//! store.login(
//!     TokenGrant::new(AccessToken::from_static("access"))
//!         .with_refresh_token(RefreshToken::from_static("refresh")),
//! );
//! assert!(store.is_logged());
//!
//! assert!(store.logout());
//! assert!(store.access_token().is_none());
//!
//! // Logging out twice is harmless
//! assert!(!store.logout());
//! ```
//!
//! Wiring a coordinator to an HTTP refresh endpoint:
//!
//! ```no_run
//! use reauth_session::{sources::RefreshEndpoint, RefreshCoordinator, SessionStore};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let store = SessionStore::new();
//! let endpoint = RefreshEndpoint::new(
//!     reqwest::Client::new(),
//!     reqwest::Url::parse("https://example.com/auth/refresh").unwrap(),
//! );
//! let coordinator = RefreshCoordinator::new(endpoint, store);
//!
//! match coordinator.refresh().await {
//!     Ok(token) => tracing::info!(token = format_args!("{:#?}", token), "renewed"),
//!     Err(error) => tracing::warn!(%error, "session ended"),
//! }
//! # }
//! ```
//!
//! # Features
//!
//! * `endpoint` (default): Provides [`RefreshEndpoint`][sources::RefreshEndpoint],
//!   a refresh source backed by [`reqwest`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod coordinator;
mod session;
pub mod sources;

pub use braids::*;
pub use coordinator::{RefreshCoordinator, RefreshError, RefreshOutcome};
pub use session::{
    BorrowedSession, Session, SessionListener, SessionStore, SessionStoreDropped,
    SessionWatcher, TokenGrant,
};
