// Route guard: decides what a protected view may show for the current auth snapshot.

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RouteConfig;
use crate::types::AuthSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub path: String,
    pub requires_privilege: bool,
}

impl Route {
    /// Any signed-in principal may enter
    pub fn protected(path: impl Into<String>) -> Self {
        Self { path: path.into(), requires_privilege: false }
    }

    /// Privileged operators only
    pub fn privileged(path: impl Into<String>) -> Self {
        Self { path: path.into(), requires_privilege: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GuardDecision {
    /// Session or privilege not known yet; show a placeholder
    Resolving,
    Unauthenticated { redirect: String, return_to: String },
    Forbidden { redirect: String },
    Granted,
}

impl GuardDecision {
    pub fn is_settled(&self) -> bool {
        !matches!(self, GuardDecision::Resolving)
    }
}

#[derive(Debug, Clone)]
pub struct RouteGuard {
    sign_in: String,
    home: String,
}

impl RouteGuard {
    pub fn new(sign_in: impl Into<String>, home: impl Into<String>) -> Self {
        Self { sign_in: sign_in.into(), home: home.into() }
    }

    pub fn from_config(routes: &RouteConfig) -> Self {
        Self::new(routes.sign_in.clone(), routes.home.clone())
    }

    pub fn evaluate(&self, snapshot: &AuthSnapshot, route: &Route) -> GuardDecision {
        if snapshot.loading {
            return GuardDecision::Resolving;
        }
        if !snapshot.has_session() {
            let return_to = if self.is_sign_in(&route.path) { self.home.clone() } else { route.path.clone() };
            return GuardDecision::Unauthenticated { redirect: self.sign_in.clone(), return_to };
        }
        if !route.requires_privilege {
            return GuardDecision::Granted;
        }
        // `privileged == false` only counts once resolved for this principal
        if !snapshot.privilege_resolved() {
            return GuardDecision::Resolving;
        }
        if snapshot.is_privileged() {
            GuardDecision::Granted
        } else {
            GuardDecision::Forbidden { redirect: self.home.clone() }
        }
    }

    /// Sign-in location carrying the return target (`/auth?redirect=%2Fadmin`)
    pub fn sign_in_location(&self, return_to: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(return_to.as_bytes()).collect();
        format!("{}?redirect={}", self.sign_in, encoded)
    }

    /// Where to go after a successful sign-in. Only same-site absolute paths
    /// are honoured, and never the sign-in route itself.
    pub fn post_sign_in_target(&self, return_to: Option<&str>) -> String {
        match return_to {
            Some(path) if path.starts_with('/') && !path.starts_with("//") && !self.is_sign_in(path) => {
                path.to_string()
            }
            _ => self.home.clone(),
        }
    }

    fn is_sign_in(&self, path: &str) -> bool {
        let bare = path.split(['?', '#']).next().unwrap_or(path);
        bare.trim_end_matches('/') == self.sign_in.trim_end_matches('/')
    }

    /// Follow `snapshots` and publish the decision for `route` whenever it changes
    pub fn watch(&self, mut snapshots: watch::Receiver<AuthSnapshot>, route: Route) -> GuardWatch {
        let initial = self.evaluate(&snapshots.borrow_and_update(), &route);
        let (tx, rx) = watch::channel(initial);
        let guard = self.clone();

        let task = tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let decision = guard.evaluate(&snapshots.borrow_and_update(), &route);
                tx.send_if_modified(|current| {
                    if *current == decision {
                        return false;
                    }
                    tracing::debug!("Guard for {}: {:?} -> {:?}", route.path, current, decision);
                    *current = decision;
                    true
                });
            }
        });

        GuardWatch { rx, task }
    }
}

/// Live guard decision for one mounted view
pub struct GuardWatch {
    rx: watch::Receiver<GuardDecision>,
    task: JoinHandle<()>,
}

impl GuardWatch {
    pub fn decision(&self) -> GuardDecision {
        self.rx.borrow().clone()
    }

    /// Wait for the next decision change
    pub async fn changed(&mut self) -> Option<GuardDecision> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub async fn wait_until(&mut self, predicate: impl FnMut(&GuardDecision) -> bool) -> Option<GuardDecision> {
        self.rx.wait_for(predicate).await.ok().map(|d| d.clone())
    }
}

impl Drop for GuardWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
