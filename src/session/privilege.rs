// Privilege lookup for the signed-in principal.
//
// The resolver is a single-record lookup that fails closed. The tracker owns
// when lookups run: off the auth-event path, at most one in flight, restarted
// when the principal changes, results applied only for the latest request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{bounded, DataApi, Query};
use crate::error::HubError;
use crate::types::{AuthSnapshot, AuthorizationState, PrincipalId, Profile, Table};

#[derive(Clone)]
pub struct PrivilegeResolver {
    data: Arc<dyn DataApi>,
    timeout: Duration,
}

impl PrivilegeResolver {
    pub fn new(data: Arc<dyn DataApi>, timeout: Duration) -> Self {
        Self { data, timeout }
    }

    /// Raw lookup; `Ok(None)` when the principal has no profile
    pub async fn lookup(&self, principal: &PrincipalId) -> Result<Option<Profile>, HubError> {
        let query = Query::table(Table::Profiles).eq("id", principal.as_str()).limit(1);
        let rows = bounded(self.timeout, self.data.select(&query))
            .await
            .map_err(|e| HubError::AuthorizationLookup(e.to_string()))?;
        rows.into_iter()
            .next()
            .map(serde_json::from_value::<Profile>)
            .transpose()
            .map_err(|e| HubError::AuthorizationLookup(e.to_string()))
    }

    /// Never fails: a missing profile, a failed lookup or a malformed row all mean "not privileged"
    pub async fn resolve_privilege(&self, principal: &PrincipalId) -> bool {
        match self.lookup(principal).await {
            Ok(Some(profile)) => profile.is_admin.unwrap_or(false),
            Ok(None) => {
                tracing::debug!("No profile for principal {}, not privileged", principal);
                false
            }
            Err(e) => {
                tracing::warn!("Privilege lookup for {} failed closed: {}", principal, e);
                false
            }
        }
    }
}

struct Pending {
    principal: Option<PrincipalId>,
    task: Option<JoinHandle<()>>,
}

/// Keeps `AuthSnapshot::authorization` in step with the session's principal
#[derive(Clone)]
pub struct PrivilegeTracker {
    resolver: PrivilegeResolver,
    state: Arc<watch::Sender<AuthSnapshot>>,
    generation: Arc<AtomicU64>,
    pending: Arc<Mutex<Pending>>,
}

impl PrivilegeTracker {
    pub fn new(resolver: PrivilegeResolver, state: Arc<watch::Sender<AuthSnapshot>>) -> Self {
        Self {
            resolver,
            state,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(Mutex::new(Pending { principal: None, task: None })),
        }
    }

    /// Schedule resolution for `principal`. Repeated requests for the same
    /// principal are ignored; a different principal cancels the lookup in flight.
    pub fn request(&self, principal: Option<PrincipalId>) {
        let Ok(mut pending) = self.pending.lock() else {
            tracing::error!("Privilege tracker state poisoned");
            return;
        };
        if pending.principal == principal && (principal.is_none() || pending.task.is_some()) {
            return;
        }
        if let Some(task) = pending.task.take() {
            task.abort();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        pending.principal = principal.clone();

        let Some(principal) = principal else {
            self.state.send_if_modified(|snapshot| {
                let cleared = AuthorizationState::signed_out();
                if snapshot.authorization == cleared {
                    return false;
                }
                snapshot.authorization = cleared;
                true
            });
            return;
        };

        self.state.send_if_modified(|snapshot| {
            if snapshot.authorization.principal.as_ref() == Some(&principal) && !snapshot.authorization.resolved {
                return false;
            }
            snapshot.authorization = AuthorizationState::pending(principal.clone());
            true
        });

        let tracker = self.clone();
        pending.task = Some(tokio::spawn(async move {
            // Leave the provider's notification path before touching the data API
            tokio::task::yield_now().await;
            let privileged = tracker.resolver.resolve_privilege(&principal).await;
            tracker.apply(generation, principal, privileged);
        }));
    }

    /// Force a fresh lookup for the current principal (profile changed out-of-band)
    pub fn refresh(&self) {
        let principal = self.state.borrow().principal().cloned();
        if let Ok(mut pending) = self.pending.lock() {
            pending.principal = None;
            if let Some(task) = pending.task.take() {
                task.abort();
            }
        }
        self.request(principal);
    }

    fn apply(&self, generation: u64, principal: PrincipalId, privileged: bool) {
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding superseded privilege result for {}", principal);
            return;
        }
        let applied = self.state.send_if_modified(|snapshot| {
            if snapshot.principal() != Some(&principal) {
                return false;
            }
            snapshot.authorization = AuthorizationState::resolved(principal.clone(), privileged);
            true
        });
        if applied {
            tracing::info!("Principal {} resolved (privileged: {})", principal, privileged);
        }
    }

    pub fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(task) = pending.task.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn missing_profile_is_not_privileged() {
        let backend = InMemoryBackend::new();
        let resolver = PrivilegeResolver::new(Arc::new(backend), Duration::from_secs(1));
        assert!(!resolver.resolve_privilege(&PrincipalId::new("ghost")).await);
    }

    #[tokio::test]
    async fn failed_lookup_fails_closed() {
        let backend = InMemoryBackend::new();
        backend
            .seed(Table::Profiles, json!({ "id": "admin-1", "is_admin": true }))
            .await;
        backend.fail_next_selects(1);
        let resolver = PrivilegeResolver::new(Arc::new(backend.clone()), Duration::from_secs(1));

        assert!(!resolver.resolve_privilege(&PrincipalId::new("admin-1")).await);
        assert!(resolver.resolve_privilege(&PrincipalId::new("admin-1")).await);
    }
}
