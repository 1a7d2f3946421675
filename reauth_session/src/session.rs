//! The session store and its observers

use std::{
    fmt, ops,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// Tokens granted by the authority, either at login or by a refresh
///
/// A refresh may omit the refresh token or the user profile, in which case
/// the values already held by the session are kept.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    /// The new access token
    pub access_token: AccessToken,

    /// A new refresh token, if the authority rotated it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,

    /// The user profile, if the authority returned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,
}

impl TokenGrant {
    /// Constructs a grant carrying only an access token
    pub fn new(access_token: AccessToken) -> Self {
        Self {
            access_token,
            refresh_token: None,
            user: None,
        }
    }

    /// Attaches a refresh token to the grant
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    /// Attaches a user profile to the grant
    pub fn with_user(mut self, user: serde_json::Value) -> Self {
        self.user = Some(user);
        self
    }
}

/// A snapshot of the authenticated session
#[derive(Clone, Debug, Default)]
pub struct Session {
    access_token: Option<AccessToken>,
    refresh_token: Option<RefreshToken>,
    user: Option<serde_json::Value>,
    is_logged: bool,
    generation: u64,
}

impl Session {
    /// The access token to present as bearer credential, if any
    #[inline]
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        self.access_token.as_deref()
    }

    /// The refresh token used to renew the session, if any
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// The user profile last reported by the authority
    #[inline]
    pub fn user(&self) -> Option<&serde_json::Value> {
        self.user.as_ref()
    }

    /// Whether a user is currently logged in
    #[inline]
    pub fn is_logged(&self) -> bool {
        self.is_logged
    }

    /// Counts login and logout transitions of the owning store
    ///
    /// Two snapshots with the same generation belong to the same login.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn merge(&mut self, grant: TokenGrant) {
        self.access_token = Some(grant.access_token);
        if let Some(refresh_token) = grant.refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        if let Some(user) = grant.user {
            self.user = Some(user);
        }
    }
}

/// Receives notifications about session changes made by the refresh machinery
///
/// Listeners are invoked synchronously, after the store has been updated, and
/// should hand any slow work (persisting, broadcasting to a UI) off elsewhere.
pub trait SessionListener: Send + Sync {
    /// Called after a refresh has renewed the session
    fn on_refreshed(&self, session: &Session);

    /// Called once when the session ends
    fn on_logged_out(&self);
}

/// A handle to the current session state
///
/// Cloning the store produces another handle to the same session.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: watch::Sender<Arc<Session>>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("session", &*self.session())
            .field("listeners", &self.listeners().len())
            .finish()
    }
}

impl SessionStore {
    /// Constructs a store with no logged-in user
    pub fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(Session::default()));
        Self {
            inner: Arc::new(StoreInner {
                state,
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Registers a listener for refresh and logout notifications
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Takes a snapshot of the current session
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.inner.state.borrow())
    }

    /// The current access token, if any
    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner.state.borrow().access_token.clone()
    }

    /// Whether a user is currently logged in
    pub fn is_logged(&self) -> bool {
        self.inner.state.borrow().is_logged
    }

    /// Subscribes to session changes
    pub fn subscribe(&self) -> SessionWatcher {
        SessionWatcher {
            watcher: self.inner.state.subscribe(),
        }
    }

    /// Starts a new session from a login grant
    ///
    /// Any previous session is replaced. Listeners are not notified, since the
    /// login was initiated by the caller.
    pub fn login(&self, grant: TokenGrant) {
        self.inner.state.send_modify(|current| {
            let mut session = Session {
                is_logged: true,
                generation: current.generation + 1,
                ..Session::default()
            };
            session.merge(grant);
            tracing::info!(
                generation = session.generation,
                has_refresh_token = session.refresh_token.is_some(),
                "session started"
            );
            *current = Arc::new(session);
        });
    }

    /// Ends the current session
    ///
    /// Clears both tokens, the user profile and the logged-in flag, then notifies
    /// listeners. Returns `false` without notifying anyone if there was no session
    /// to end.
    pub fn logout(&self) -> bool {
        self.end_session(None)
    }

    /// Reads what a refresh cycle needs to start: the generation it will act for
    /// and the refresh token to present
    pub(crate) fn refresh_context(&self) -> (u64, Option<RefreshToken>) {
        let session = self.inner.state.borrow();
        let refresh_token = if session.is_logged {
            session.refresh_token.clone()
        } else {
            None
        };
        (session.generation, refresh_token)
    }

    /// Merges a refresh grant into the session started under `generation`
    ///
    /// Returns `false` if that session has ended in the meantime, in which case
    /// the grant is discarded.
    pub(crate) fn apply_refresh(&self, generation: u64, grant: TokenGrant) -> bool {
        let applied = self.inner.state.send_if_modified(|current| {
            if !current.is_logged || current.generation != generation {
                return false;
            }
            let mut session = Session::clone(&**current);
            session.merge(grant);
            *current = Arc::new(session);
            true
        });

        if applied {
            let session = self.session();
            tracing::debug!(generation, "session refreshed");
            for listener in self.listeners() {
                listener.on_refreshed(&session);
            }
        } else {
            tracing::debug!(generation, "session ended during refresh, discarding grant");
        }

        applied
    }

    /// Ends the session, but only if it is still the one started under `generation`
    pub(crate) fn end_session_for(&self, generation: u64) -> bool {
        self.end_session(Some(generation))
    }

    fn end_session(&self, expected: Option<u64>) -> bool {
        let ended = self.inner.state.send_if_modified(|current| {
            if expected.is_some_and(|g| g != current.generation) {
                return false;
            }
            if !current.is_logged && current.access_token.is_none() && current.refresh_token.is_none()
            {
                return false;
            }
            *current = Arc::new(Session {
                generation: current.generation + 1,
                ..Session::default()
            });
            true
        });

        if ended {
            tracing::info!("session ended");
            for listener in self.listeners() {
                listener.on_logged_out();
            }
        }

        ended
    }

    fn listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A watcher that can be used to observe session changes
#[derive(Clone, Debug)]
pub struct SessionWatcher {
    watcher: watch::Receiver<Arc<Session>>,
}

/// An outstanding borrow of the session
///
/// This borrow should be held for as brief a time as possible, as outstanding
/// borrows block updates to the session.
#[derive(Debug)]
pub struct BorrowedSession<'a> {
    inner: watch::Ref<'a, Arc<Session>>,
}

impl<'a> ops::Deref for BorrowedSession<'a> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// The session store was dropped and no further changes will be published
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("session store has been dropped")]
pub struct SessionStoreDropped;

impl SessionWatcher {
    /// Borrows the latest session
    pub fn session(&self) -> BorrowedSession<'_> {
        BorrowedSession {
            inner: self.watcher.borrow(),
        }
    }

    /// Waits until the session changes
    pub async fn changed(&mut self) -> Result<(), SessionStoreDropped> {
        self.watcher.changed().await.map_err(|_| SessionStoreDropped)
    }
}
