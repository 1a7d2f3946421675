use std::{
    collections::VecDeque,
    error, fmt, mem,
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::{sources::RefreshSource, AccessToken, Session, SessionStore};

/// The settled result of one refresh cycle, shared by every caller that waited on it
pub type RefreshOutcome = Result<AccessToken, Arc<RefreshError>>;

/// An error renewing the session
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The session holds no refresh token, so there was nothing to exchange
    #[error("session has no refresh token")]
    MissingRefreshToken,
    /// The refresh source failed or rejected the refresh token
    #[error("refresh source failed to renew the session")]
    Source(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The session was logged out or replaced while the refresh was in flight
    #[error("session ended while its refresh was in flight")]
    SessionEnded,
    /// The refresh cycle stopped without producing an outcome
    #[error("refresh cycle ended without an outcome")]
    Abandoned,
}

enum RefreshState {
    Idle,
    InFlight {
        generation: u64,
        waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
    },
}

/// How a caller was admitted to a refresh cycle
enum Admission {
    /// The caller opened a new cycle for the session of this generation
    Started(u64),
    /// The caller joined the cycle in flight, which may belong to an earlier login
    Joined { stale: bool },
    /// The caller's outcome was known without waiting on a cycle
    Settled(RefreshOutcome),
}

/// Coordinates renewal of a session's access token
///
/// However many callers ask for a refresh at once, at most one call to the
/// refresh source is outstanding. Callers arriving while a refresh is in flight
/// are queued and all receive that refresh's outcome. Once the outcome is
/// delivered, the next caller starts a new refresh.
///
/// When a refresh fails, the session is logged out before any caller learns of
/// the failure.
///
/// The refresh itself runs on a spawned task, so this must be used from within
/// a tokio runtime.
pub struct RefreshCoordinator<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    source: S,
    store: SessionStore,
    state: Mutex<RefreshState>,
}

impl<S> Clone for RefreshCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for RefreshCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("store", &self.inner.store)
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

impl<S> RefreshCoordinator<S> {
    /// The session store this coordinator renews
    #[inline]
    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock(), RefreshState::InFlight { .. })
    }
}

impl<S: RefreshSource> RefreshCoordinator<S> {
    /// Constructs a coordinator renewing `store` through `source`
    pub fn new(source: S, store: SessionStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    /// Obtains a renewed access token for the current session
    ///
    /// Starts a refresh if none is in flight, otherwise waits for the one that
    /// is. Dropping the returned future does not cancel a refresh that has
    /// already started.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.obtain(None).await
    }

    /// Obtains a replacement for the access token carried by `rejected`
    ///
    /// If the session has moved on to a different access token since the
    /// snapshot was taken, that token is returned without another refresh. If
    /// the snapshot's session has since been logged out or replaced by a new
    /// login, fails with [`RefreshError::SessionEnded`].
    pub async fn renew(&self, rejected: &Session) -> RefreshOutcome {
        self.obtain(Some(rejected)).await
    }

    async fn obtain(&self, rejected: Option<&Session>) -> RefreshOutcome {
        loop {
            let (tx, rx) = oneshot::channel();

            let stale = match self.inner.admit(tx, rejected) {
                Admission::Settled(outcome) => return outcome,
                Admission::Started(generation) => {
                    let span = tracing::debug_span!("refresh_cycle", generation);
                    tokio::spawn(
                        run_cycle(Arc::clone(&self.inner), generation).instrument(span),
                    );
                    false
                }
                Admission::Joined { stale } => stale,
            };

            let outcome = rx
                .await
                .unwrap_or_else(|_| Err(Arc::new(RefreshError::Abandoned)));

            // A cycle for an earlier login says nothing about the current one
            if stale && outcome.is_err() {
                tracing::debug!("refresh of an earlier login settled, renewing the current one");
                continue;
            }

            return outcome;
        }
    }
}

impl<S> Inner<S> {
    fn lock(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides whether a caller starts a cycle, joins one or needs none
    fn admit(
        &self,
        waiter: oneshot::Sender<RefreshOutcome>,
        rejected: Option<&Session>,
    ) -> Admission {
        let mut state = self.lock();
        let session = self.store.session();
        let generation = session.generation();

        if rejected.is_some_and(|r| r.generation() != generation) {
            tracing::debug!(generation, "rejected token belongs to a session that has ended");
            return Admission::Settled(Err(Arc::new(RefreshError::SessionEnded)));
        }

        if let RefreshState::InFlight {
            generation: cycle,
            waiters,
        } = &mut *state
        {
            waiters.push_back(waiter);
            let stale = *cycle < generation;
            tracing::trace!(waiters = waiters.len(), stale, "joined refresh in flight");
            return Admission::Joined { stale };
        }

        let rejected_token = rejected.and_then(Session::access_token);
        if let (Some(rejected_token), Some(current)) = (rejected_token, session.access_token()) {
            if session.is_logged() && rejected_token != current {
                tracing::debug!(generation, "session was renewed after the token was rejected");
                return Admission::Settled(Ok(current.to_owned()));
            }
        }

        *state = RefreshState::InFlight {
            generation,
            waiters: VecDeque::from([waiter]),
        };
        Admission::Started(generation)
    }

    /// Hands the outcome to every queued waiter and returns to idle
    fn settle(&self, outcome: RefreshOutcome) {
        let waiters = match mem::replace(&mut *self.lock(), RefreshState::Idle) {
            RefreshState::InFlight { waiters, .. } => waiters,
            RefreshState::Idle => VecDeque::new(),
        };

        tracing::debug!(
            waiters = waiters.len(),
            succeeded = outcome.is_ok(),
            "refresh settled"
        );

        for waiter in waiters {
            if waiter.send(outcome.clone()).is_err() {
                tracing::trace!("refresh waiter went away before the outcome arrived");
            }
        }
    }

    fn fail(&self, generation: u64, error: RefreshError) -> Arc<RefreshError> {
        self.store.end_session_for(generation);
        Arc::new(error)
    }
}

impl<S: RefreshSource> Inner<S> {
    async fn perform(&self, generation: u64) -> RefreshOutcome {
        let (current, refresh_token) = self.store.refresh_context();
        if current != generation {
            return Err(Arc::new(RefreshError::SessionEnded));
        }

        let Some(refresh_token) = refresh_token else {
            tracing::warn!(generation, "no refresh token available, ending session");
            return Err(self.fail(generation, RefreshError::MissingRefreshToken));
        };

        tracing::debug!(generation, "requesting token refresh");

        match self.source.refresh(&refresh_token).await {
            Ok(grant) => {
                let access_token = grant.access_token.clone();
                if self.store.apply_refresh(generation, grant) {
                    Ok(access_token)
                } else {
                    Err(Arc::new(RefreshError::SessionEnded))
                }
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "token refresh failed, ending session"
                );
                Err(self.fail(generation, RefreshError::Source(Box::new(error))))
            }
        }
    }
}

async fn run_cycle<S: RefreshSource>(inner: Arc<Inner<S>>, generation: u64) {
    let guard = CycleGuard {
        inner: &inner,
        generation,
        settled: false,
    };
    let outcome = inner.perform(generation).await;
    guard.settle(outcome);
}

/// Releases the waiters of a cycle that stops before settling
///
/// Such a cycle counts as a failed refresh, so its session is ended first.
struct CycleGuard<'a, S> {
    inner: &'a Inner<S>,
    generation: u64,
    settled: bool,
}

impl<'a, S> CycleGuard<'a, S> {
    fn settle(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.inner.settle(outcome);
    }
}

impl<'a, S> Drop for CycleGuard<'a, S> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::error!(
                generation = self.generation,
                "refresh cycle stopped before settling, ending session"
            );
            let error = self.inner.fail(self.generation, RefreshError::Abandoned);
            self.inner.settle(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::{RefreshToken, RefreshTokenRef, SessionListener, TokenGrant};

    #[derive(Debug, Error)]
    #[error("authority unavailable")]
    struct Unavailable;

    enum Script {
        Grant(TokenGrant),
        Fail,
        Panic,
    }

    struct ScriptedSource {
        calls: Arc<AtomicUsize>,
        presented: Arc<Mutex<Vec<String>>>,
        gate: Option<Arc<Notify>>,
        script: Script,
    }

    impl ScriptedSource {
        fn new(script: Script) -> Self {
            Self {
                calls: Arc::default(),
                presented: Arc::default(),
                gate: None,
                script,
            }
        }

        fn granting(access_token: &'static str) -> Self {
            Self::new(Script::Grant(TokenGrant::new(AccessToken::from_static(
                access_token,
            ))))
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl RefreshSource for ScriptedSource {
        type Error = Unavailable;

        async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenGrant, Unavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.presented
                .lock()
                .unwrap()
                .push(refresh_token.as_str().to_owned());

            tokio::task::yield_now().await;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }

            match &self.script {
                Script::Grant(grant) => Ok(grant.clone()),
                Script::Fail => Err(Unavailable),
                Script::Panic => panic!("refresh source exploded"),
            }
        }
    }

    #[derive(Default)]
    struct CountingListener {
        refreshed: AtomicUsize,
        logged_out: AtomicUsize,
    }

    impl SessionListener for CountingListener {
        fn on_refreshed(&self, _: &Session) {
            self.refreshed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_logged_out(&self) {
            self.logged_out.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        coordinator: RefreshCoordinator<ScriptedSource>,
        calls: Arc<AtomicUsize>,
        presented: Arc<Mutex<Vec<String>>>,
        listener: Arc<CountingListener>,
    }

    fn harness(source: ScriptedSource) -> Harness {
        let store = SessionStore::new();
        let listener = Arc::new(CountingListener::default());
        store.add_listener(listener.clone());
        store.login(
            TokenGrant::new(AccessToken::from_static("expired"))
                .with_refresh_token(RefreshToken::from_static("refresh-1")),
        );

        Harness {
            calls: Arc::clone(&source.calls),
            presented: Arc::clone(&source.presented),
            coordinator: RefreshCoordinator::new(source, store),
            listener,
        }
    }

    impl Harness {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn store(&self) -> &SessionStore {
            self.coordinator.store()
        }
    }

    mod when_refresh_succeeds {
        use super::*;

        #[tokio::test]
        async fn concurrent_callers_share_a_single_refresh() {
            let h = harness(ScriptedSource::granting("fresh"));
            let c = &h.coordinator;

            let outcomes = tokio::join!(
                c.refresh(),
                c.refresh(),
                c.refresh(),
                c.refresh(),
                c.refresh()
            );

            assert_eq!(h.calls(), 1);
            for outcome in [outcomes.0, outcomes.1, outcomes.2, outcomes.3, outcomes.4] {
                assert_eq!(outcome.unwrap().as_str(), "fresh");
            }
            assert_eq!(h.listener.refreshed.load(Ordering::SeqCst), 1);
            assert!(!c.is_refreshing());
        }

        #[tokio::test]
        async fn session_holds_the_new_access_token() {
            let h = harness(ScriptedSource::granting("fresh"));

            h.coordinator.refresh().await.unwrap();

            let session = h.store().session();
            assert!(session.is_logged());
            assert_eq!(session.access_token().unwrap().as_str(), "fresh");
            assert_eq!(session.refresh_token().unwrap().as_str(), "refresh-1");
            assert_eq!(*h.presented.lock().unwrap(), ["refresh-1"]);
        }

        #[tokio::test]
        async fn a_caller_after_settlement_starts_a_new_refresh() {
            let h = harness(ScriptedSource::granting("fresh"));

            h.coordinator.refresh().await.unwrap();
            assert!(!h.coordinator.is_refreshing());
            h.coordinator.refresh().await.unwrap();

            assert_eq!(h.calls(), 2);
        }

        #[tokio::test]
        async fn rotated_refresh_token_is_presented_next_time() {
            let source = ScriptedSource::new(Script::Grant(
                TokenGrant::new(AccessToken::from_static("fresh"))
                    .with_refresh_token(RefreshToken::from_static("refresh-2")),
            ));
            let h = harness(source);

            h.coordinator.refresh().await.unwrap();
            h.coordinator.refresh().await.unwrap();

            assert_eq!(*h.presented.lock().unwrap(), ["refresh-1", "refresh-2"]);
        }
    }

    mod when_refresh_fails {
        use super::*;

        #[tokio::test]
        async fn every_caller_sees_the_same_error() {
            let h = harness(ScriptedSource::new(Script::Fail));
            let c = &h.coordinator;

            let outcomes = tokio::join!(
                c.refresh(),
                c.refresh(),
                c.refresh(),
                c.refresh(),
                c.refresh()
            );

            assert_eq!(h.calls(), 1);
            let errors: Vec<_> = [outcomes.0, outcomes.1, outcomes.2, outcomes.3, outcomes.4]
                .into_iter()
                .map(|o| o.unwrap_err())
                .collect();
            assert!(matches!(*errors[0], RefreshError::Source(_)));
            assert!(errors.iter().all(|e| Arc::ptr_eq(e, &errors[0])));
        }

        #[tokio::test]
        async fn session_is_logged_out_exactly_once() {
            let h = harness(ScriptedSource::new(Script::Fail));
            let c = &h.coordinator;

            let _ = tokio::join!(
                c.refresh(),
                c.refresh(),
                c.refresh(),
                c.refresh(),
                c.refresh()
            );

            let session = h.store().session();
            assert!(!session.is_logged());
            assert!(session.access_token().is_none());
            assert!(session.refresh_token().is_none());
            assert_eq!(h.listener.logged_out.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn session_is_already_cleared_when_the_caller_sees_the_error() {
            let h = harness(ScriptedSource::new(Script::Fail));

            let error = h.coordinator.refresh().await.unwrap_err();

            assert!(matches!(*error, RefreshError::Source(_)));
            assert!(!h.store().is_logged());
        }
    }

    mod when_session_has_no_refresh_token {
        use super::*;

        #[tokio::test]
        async fn fails_without_calling_the_source() {
            let h = harness(ScriptedSource::granting("fresh"));
            h.store()
                .login(TokenGrant::new(AccessToken::from_static("no-refresh")));

            let error = h.coordinator.refresh().await.unwrap_err();

            assert!(matches!(*error, RefreshError::MissingRefreshToken));
            assert_eq!(h.calls(), 0);
            assert!(!h.store().is_logged());
            assert_eq!(h.listener.logged_out.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn logged_out_store_is_not_refreshed() {
            let h = harness(ScriptedSource::granting("fresh"));
            h.store().logout();

            let error = h.coordinator.refresh().await.unwrap_err();

            assert!(matches!(*error, RefreshError::MissingRefreshToken));
            assert_eq!(h.calls(), 0);
            assert_eq!(h.listener.logged_out.load(Ordering::SeqCst), 1);
        }
    }

    mod when_session_ends_mid_refresh {
        use super::*;

        async fn wait_for_call(h: &Harness) {
            while h.calls() == 0 {
                tokio::task::yield_now().await;
            }
        }

        #[tokio::test]
        async fn grant_is_discarded() {
            let gate = Arc::new(Notify::new());
            let h = harness(ScriptedSource::granting("fresh").gated(gate.clone()));

            let pending = tokio::spawn({
                let c = h.coordinator.clone();
                async move { c.refresh().await }
            });
            wait_for_call(&h).await;

            h.store().logout();
            gate.notify_one();

            let error = pending.await.unwrap().unwrap_err();
            assert!(matches!(*error, RefreshError::SessionEnded));
            assert!(!h.store().is_logged());
            assert!(h.store().access_token().is_none());
            assert_eq!(h.listener.refreshed.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn failure_does_not_log_out_a_newer_login() {
            let gate = Arc::new(Notify::new());
            let h = harness(ScriptedSource::new(Script::Fail).gated(gate.clone()));

            let pending = tokio::spawn({
                let c = h.coordinator.clone();
                async move { c.refresh().await }
            });
            wait_for_call(&h).await;

            h.store()
                .login(TokenGrant::new(AccessToken::from_static("second-login")));
            gate.notify_one();

            assert!(pending.await.unwrap().is_err());
            assert!(h.store().is_logged());
            assert_eq!(h.store().access_token().unwrap().as_str(), "second-login");
            assert_eq!(h.listener.logged_out.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn caller_from_a_newer_login_gets_its_own_refresh() {
            let gate = Arc::new(Notify::new());
            let h = harness(ScriptedSource::granting("fresh").gated(gate.clone()));
            let c = &h.coordinator;

            let first = tokio::spawn({
                let c = c.clone();
                async move { c.refresh().await }
            });
            wait_for_call(&h).await;

            h.store().logout();
            h.store().login(
                TokenGrant::new(AccessToken::from_static("second-login"))
                    .with_refresh_token(RefreshToken::from_static("refresh-2")),
            );

            // Joins the cycle of the first login, then releases both cycles in turn
            let (second, ()) = tokio::join!(c.refresh(), async {
                gate.notify_one();
                while h.calls() < 2 {
                    tokio::task::yield_now().await;
                }
                gate.notify_one();
            });

            assert_eq!(second.unwrap().as_str(), "fresh");
            assert!(matches!(
                *first.await.unwrap().unwrap_err(),
                RefreshError::SessionEnded
            ));
            assert_eq!(h.calls(), 2);
            assert_eq!(*h.presented.lock().unwrap(), ["refresh-1", "refresh-2"]);
            assert!(h.store().is_logged());
            assert_eq!(h.store().access_token().unwrap().as_str(), "fresh");
            assert_eq!(h.listener.logged_out.load(Ordering::SeqCst), 1);
            assert!(!c.is_refreshing());
        }
    }

    mod when_renewing_a_rejected_token {
        use super::*;

        #[tokio::test]
        async fn current_token_is_refreshed() {
            let h = harness(ScriptedSource::granting("fresh"));

            let token = h.coordinator.renew(&h.store().session()).await.unwrap();

            assert_eq!(token.as_str(), "fresh");
            assert_eq!(h.calls(), 1);
        }

        #[tokio::test]
        async fn token_renewed_in_the_meantime_is_reused() {
            let h = harness(ScriptedSource::granting("fresh"));
            let rejected = h.store().session();
            h.coordinator.refresh().await.unwrap();

            let token = h.coordinator.renew(&rejected).await.unwrap();

            assert_eq!(token.as_str(), "fresh");
            assert_eq!(h.calls(), 1);
        }

        #[tokio::test]
        async fn token_of_an_ended_session_is_not_renewed() {
            let h = harness(ScriptedSource::granting("fresh"));
            let rejected = h.store().session();
            h.store().logout();
            h.store().login(
                TokenGrant::new(AccessToken::from_static("second-login"))
                    .with_refresh_token(RefreshToken::from_static("refresh-2")),
            );

            let error = h.coordinator.renew(&rejected).await.unwrap_err();

            assert!(matches!(*error, RefreshError::SessionEnded));
            assert_eq!(h.calls(), 0);
            assert!(h.store().is_logged());
            assert_eq!(h.store().access_token().unwrap().as_str(), "second-login");
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn callers_on_many_threads_share_a_single_refresh() {
            for _ in 0..50 {
                let h = harness(ScriptedSource::granting("fresh"));
                let rejected = h.store().session();

                let tasks: Vec<_> = (0..8)
                    .map(|_| {
                        let c = h.coordinator.clone();
                        let rejected = Arc::clone(&rejected);
                        tokio::spawn(async move { c.renew(&rejected).await })
                    })
                    .collect();

                for task in tasks {
                    assert_eq!(task.await.unwrap().unwrap().as_str(), "fresh");
                }
                assert_eq!(h.calls(), 1);
            }
        }
    }

    #[tokio::test]
    async fn dropping_the_initiator_does_not_strand_the_cycle() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedSource::granting("fresh").gated(gate.clone()));

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), h.coordinator.refresh()).await;
        assert!(timed_out.is_err());
        assert!(h.coordinator.is_refreshing());

        gate.notify_one();
        let token = h.coordinator.refresh().await.unwrap();

        assert_eq!(token.as_str(), "fresh");
        assert_eq!(h.calls(), 1);
        assert!(!h.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn panicking_source_releases_its_waiters() {
        let h = harness(ScriptedSource::new(Script::Panic));

        let error = h.coordinator.refresh().await.unwrap_err();

        assert!(matches!(*error, RefreshError::Abandoned));
        assert!(!h.coordinator.is_refreshing());
        assert!(!h.store().is_logged());
        assert_eq!(h.listener.logged_out.load(Ordering::SeqCst), 1);
    }
}
