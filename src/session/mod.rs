// Session store: the single source of truth for "who is signed in, and are they privileged".
//
// State lives in a `watch` channel of `AuthSnapshot`. Only this module and the
// privilege tracker write to it; everything else subscribes.

pub mod expiry;
pub mod privilege;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backend::{bounded, AuthEvent, AuthEventKind, AuthProvider, BackendError, DataApi};
use crate::error::HubError;
use crate::notify::Notifier;
use crate::types::{AuthSnapshot, AuthorizationState, Session};

pub use expiry::{ExpiryWatch, REFRESH_MARGIN};
pub use privilege::{PrivilegeResolver, PrivilegeTracker};

/// Result of `sign_out`. Local state is cleared in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutOutcome {
    Completed,
    /// Local state was cleared but the provider could not be told
    RemoteFailed(HubError),
    NotSignedIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn(Session),
    /// The provider requires email verification before a session exists
    ConfirmationRequired,
}

/// Everything the listener and the expiry timer need to change the snapshot
#[derive(Clone)]
struct Shared {
    auth: Arc<dyn AuthProvider>,
    state: Arc<watch::Sender<AuthSnapshot>>,
    tracker: PrivilegeTracker,
    expiry: ExpiryWatch,
    notifier: Notifier,
    timeout: Duration,
}

struct Inner {
    shared: Shared,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        data: Arc<dyn DataApi>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Self {
        Self::with_refresh_margin(auth, data, notifier, timeout, REFRESH_MARGIN)
    }

    /// Like `new`, refreshing access tokens `margin` before they expire
    pub fn with_refresh_margin(
        auth: Arc<dyn AuthProvider>,
        data: Arc<dyn DataApi>,
        notifier: Notifier,
        timeout: Duration,
        margin: Duration,
    ) -> Self {
        let (state, _) = watch::channel(AuthSnapshot::initial());
        let state = Arc::new(state);
        let tracker = PrivilegeTracker::new(PrivilegeResolver::new(data, timeout), state.clone());
        Self {
            inner: Arc::new(Inner {
                shared: Shared {
                    auth,
                    state,
                    tracker,
                    expiry: ExpiryWatch::new(margin),
                    notifier,
                    timeout,
                },
                listener: Mutex::new(None),
            }),
        }
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Restore the persisted session and start following provider session changes.
    /// Calling it again is a no-op.
    pub async fn start(&self) {
        if self.listener_running() {
            return;
        }
        let shared = self.shared();
        // Subscribe before restoring so a change racing the restore is not lost
        let events = shared.auth.subscribe();

        let restored = match bounded(shared.timeout, shared.auth.current_session()).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Could not restore persisted session: {}", e);
                None
            }
        };
        match &restored {
            Some(session) => tracing::info!("Restored session for {}", session.principal),
            None => tracing::info!("No persisted session"),
        }
        shared.apply(restored);

        let handle = tokio::spawn(listen(events, shared.clone()));
        if let Ok(mut listener) = self.inner.listener.lock() {
            *listener = Some(handle);
        }
    }

    fn listener_running(&self) -> bool {
        self.inner
            .listener
            .lock()
            .map(|listener| listener.is_some())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.shared().state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.shared().state.subscribe()
    }

    /// Resolve once the snapshot satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&AuthSnapshot) -> bool) -> AuthSnapshot {
        let mut rx = self.subscribe();
        let snapshot = match rx.wait_for(predicate).await {
            Ok(snapshot) => snapshot.clone(),
            // The store owns the sender, so this only happens mid-teardown
            Err(_) => self.snapshot(),
        };
        snapshot
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, HubError> {
        let shared = self.shared();
        let result = bounded(shared.timeout, shared.auth.sign_in_with_password(email, password))
            .await
            .map_err(HubError::authentication);
        match result {
            Ok(session) => {
                tracing::info!("Signed in as {}", session.principal);
                shared.apply(Some(session.clone()));
                shared.notifier.success("Signed in successfully");
                Ok(session)
            }
            Err(e) => {
                tracing::info!("Sign-in rejected: {}", e);
                shared.notifier.failure("Login failed", &e);
                Err(e)
            }
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, HubError> {
        let shared = self.shared();
        let result = bounded(shared.timeout, shared.auth.sign_up(email, password))
            .await
            .map_err(HubError::authentication);
        match result {
            Ok(Some(session)) => {
                tracing::info!("Signed up and signed in as {}", session.principal);
                shared.apply(Some(session.clone()));
                shared.notifier.success("Account created");
                Ok(SignUpOutcome::SignedIn(session))
            }
            Ok(None) => {
                shared
                    .notifier
                    .success("Registration successful! Please check your email for verification.");
                Ok(SignUpOutcome::ConfirmationRequired)
            }
            Err(e) => {
                shared.notifier.failure("Signup failed", &e);
                Err(e)
            }
        }
    }

    /// Clears local state first, then tells the provider. A failed remote call
    /// is reported but never restores the session.
    pub async fn sign_out(&self) -> SignOutOutcome {
        let Some(session) = self.snapshot().session else {
            return SignOutOutcome::NotSignedIn;
        };
        let shared = self.shared();
        shared.apply(None);
        tracing::info!("Signed out {} locally", session.principal);

        match bounded(shared.timeout, shared.auth.sign_out(&session)).await {
            Ok(()) => {
                shared.notifier.success("Signed out");
                SignOutOutcome::Completed
            }
            Err(e) => {
                let err = HubError::authentication(e);
                tracing::warn!("Remote sign-out failed, local session already cleared: {}", err);
                shared.notifier.failure("Sign out failed", &err);
                SignOutOutcome::RemoteFailed(err)
            }
        }
    }

    pub async fn reset_secret(&self, email: &str) -> Result<(), HubError> {
        let shared = self.shared();
        match bounded(shared.timeout, shared.auth.reset_password_for_email(email))
            .await
            .map_err(HubError::authentication)
        {
            Ok(()) => {
                shared.notifier.success("Password reset email sent");
                Ok(())
            }
            Err(e) => {
                shared.notifier.failure("Password reset failed", &e);
                Err(e)
            }
        }
    }

    /// Re-run the privilege lookup, e.g. after the profile changed out-of-band
    pub fn refresh_privilege(&self) {
        self.shared().tracker.refresh();
    }

    pub fn shutdown(&self) {
        if let Ok(mut listener) = self.inner.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
        self.shared().expiry.disarm();
        self.shared().tracker.shutdown();
        tracing::debug!("Session store shut down");
    }
}

impl Shared {
    /// Install `session` (or its absence), schedule privilege resolution and
    /// arm the refresh timer. Clearing the session clears authorization in the same update.
    fn apply(&self, session: Option<Session>) {
        let principal = session.as_ref().map(|s| s.principal.clone());
        self.state.send_if_modified(|snapshot| {
            let mut changed = snapshot.loading;
            snapshot.loading = false;
            if snapshot.session != session {
                let principal_changed = snapshot.principal() != principal.as_ref();
                snapshot.session = session.clone();
                if principal_changed {
                    snapshot.authorization = match &principal {
                        Some(p) => AuthorizationState::pending(p.clone()),
                        None => AuthorizationState::signed_out(),
                    };
                }
                changed = true;
            }
            changed
        });
        self.tracker.request(principal);

        let ctx = self.clone();
        self.expiry.arm(session.as_ref(), move |due| ctx.renew(due));
    }

    fn holds(&self, session: &Session) -> bool {
        self.state
            .borrow()
            .session
            .as_ref()
            .is_some_and(|current| current.access_token == session.access_token)
    }

    async fn renew(self, session: Session) {
        tracing::debug!("Refreshing access token for {}", session.principal);
        match bounded(self.timeout, self.auth.refresh_session(&session)).await {
            Ok(refreshed) => {
                if self.holds(&session) {
                    tracing::info!("Refreshed access token for {}", refreshed.principal);
                    self.apply(Some(refreshed));
                }
            }
            Err(e @ (BackendError::Network(_) | BackendError::Timeout(_))) => {
                tracing::warn!("Token refresh for {} failed, retrying: {}", session.principal, e);
                tokio::time::sleep(expiry::REFRESH_RETRY).await;
                if self.holds(&session) {
                    self.expiry.reset();
                    self.apply(Some(session));
                }
            }
            Err(e) => {
                // Another sign-in replaced this session meanwhile
                if !self.holds(&session) && self.state.borrow().session.is_some() {
                    return;
                }
                tracing::info!("Session for {} ended: {}", session.principal, e);
                self.apply(None);
                self.notifier.failure("Session expired", &HubError::authentication(e));
            }
        }
    }
}

async fn listen(mut events: broadcast::Receiver<AuthEvent>, ctx: Shared) {
    loop {
        match events.recv().await {
            Ok(event) => {
                tracing::debug!("Auth event {:?}", event.kind);
                match event.kind {
                    AuthEventKind::SignedOut => ctx.apply(None),
                    AuthEventKind::SignedIn | AuthEventKind::TokenRefreshed => ctx.apply(event.session),
                    AuthEventKind::UserUpdated => {
                        ctx.apply(event.session);
                        ctx.tracker.refresh();
                    }
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Missed {} auth events, resyncing session", missed);
                match bounded(ctx.timeout, ctx.auth.current_session()).await {
                    Ok(session) => ctx.apply(session),
                    Err(e) => tracing::warn!("Session resync failed: {}", e),
                }
            }
            Err(RecvError::Closed) => {
                tracing::debug!("Auth event stream closed");
                break;
            }
        }
    }
}
