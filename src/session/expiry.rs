// Access-token expiry timer. One timer per access token; a new token replaces
// the old timer and clearing the session cancels it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::types::Session;

/// Refresh this long before `expires_at`
pub const REFRESH_MARGIN: Duration = Duration::from_secs(10);

/// Pause before retrying a refresh that failed in transit
pub const REFRESH_RETRY: Duration = Duration::from_secs(5);

struct Scheduled {
    token: Option<String>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ExpiryWatch {
    margin: Duration,
    scheduled: Arc<Mutex<Scheduled>>,
}

impl ExpiryWatch {
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            scheduled: Arc::new(Mutex::new(Scheduled { token: None, task: None })),
        }
    }

    /// Wait before refreshing `session`. Tokens that live shorter than the
    /// margin are refreshed halfway through what is left of them.
    pub fn delay_for(&self, session: &Session) -> Duration {
        let remaining = (session.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining > self.margin {
            remaining - self.margin
        } else {
            remaining / 2
        }
    }

    /// Run `on_due` shortly before `session` expires. Arming again for the
    /// same access token keeps the running timer; `None` cancels it.
    pub fn arm<F, Fut>(&self, session: Option<&Session>, on_due: F)
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut scheduled) = self.scheduled.lock() else {
            tracing::error!("Expiry timer state poisoned");
            return;
        };
        let token = session.map(|s| s.access_token.clone());
        if scheduled.token == token {
            return;
        }
        if let Some(task) = scheduled.task.take() {
            task.abort();
        }
        scheduled.token = token;

        let Some(session) = session.cloned() else {
            return;
        };
        let delay = self.delay_for(&session);
        tracing::debug!("Access token for {} refreshes in {:?}", session.principal, delay);

        let shared = self.scheduled.clone();
        scheduled.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach from the slot so re-arming from `on_due` cannot abort this task
            let current = match shared.lock() {
                Ok(mut slot) if slot.token.as_deref() == Some(session.access_token.as_str()) => {
                    slot.task.take();
                    true
                }
                _ => false,
            };
            if current {
                on_due(session).await;
            }
        }));
    }

    /// Forget the armed token so the next `arm` for it starts a fresh timer
    pub fn reset(&self) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.token = None;
            if let Some(task) = scheduled.task.take() {
                task.abort();
            }
        }
    }

    pub fn disarm(&self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session(token: &str, expires_in: chrono::Duration) -> Session {
        Session {
            principal: PrincipalId::new("p-1"),
            email: None,
            access_token: token.into(),
            refresh_token: Some("r".into()),
            expires_at: Utc::now() + expires_in,
        }
    }

    #[test]
    fn delay_leaves_the_margin_before_expiry() {
        let watch = ExpiryWatch::new(Duration::from_secs(10));
        let long = watch.delay_for(&session("a", chrono::Duration::seconds(3600)));
        assert!(long <= Duration::from_secs(3590) && long > Duration::from_secs(3580));

        let short = watch.delay_for(&session("b", chrono::Duration::seconds(4)));
        assert!(short <= Duration::from_secs(2));

        let expired = watch.delay_for(&session("c", chrono::Duration::seconds(-5)));
        assert_eq!(expired, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_the_same_token_keeps_one_timer() {
        let watch = ExpiryWatch::new(Duration::from_secs(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let s = session("a", chrono::Duration::seconds(60));
        for _ in 0..3 {
            let counter = fired.clone();
            watch.arm(Some(&s), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_session_cancels_the_timer() {
        let watch = ExpiryWatch::new(Duration::from_secs(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watch.arm(Some(&session("a", chrono::Duration::seconds(30))), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        watch.arm(None, |_| async {});
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
