// Live query: fetch a collection, keep it current from change notifications.
//
// Each activation is tagged with a generation. Results from any other
// generation are dropped, and deactivation waits for the driver task to finish,
// so a view never sees an update after it has been torn down. Notifications
// trigger a full refetch; a burst of queued notifications costs one refetch.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{bounded, BackendError, ChangeFeed, ChangeSubscription, DataApi, Query};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::notify::{Notice, Notifier};
use crate::types::ChangeScope;

pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, HubError>> + Send + Sync>;

/// What a view shows: the change scopes it listens to and how to load it
pub struct LiveTarget<T> {
    label: String,
    scopes: Vec<ChangeScope>,
    fetcher: Fetcher<T>,
}

impl<T> Clone for LiveTarget<T> {
    fn clone(&self) -> Self {
        Self { label: self.label.clone(), scopes: self.scopes.clone(), fetcher: self.fetcher.clone() }
    }
}

impl<T: Send + 'static> LiveTarget<T> {
    pub fn new<F, Fut>(label: impl Into<String>, scopes: Vec<ChangeScope>, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HubError>> + Send + 'static,
    {
        Self {
            label: label.into(),
            scopes,
            fetcher: Arc::new(move || fetch().boxed()),
        }
    }

    /// Target backed by one collection query and a row mapper
    pub fn query<M>(data: Arc<dyn DataApi>, query: Query, scopes: Vec<ChangeScope>, mapper: M) -> Self
    where
        M: Fn(Vec<Value>) -> Result<T, HubError> + Send + Sync + 'static,
    {
        let label = format!("{}", query.table);
        let mapper = Arc::new(mapper);
        Self::new(label, scopes, move || {
            let data = data.clone();
            let query = query.clone();
            let mapper = mapper.clone();
            async move {
                let rows = data.select(&query).await.map_err(HubError::data_fetch)?;
                mapper(rows)
            }
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn scopes(&self) -> &[ChangeScope] {
        &self.scopes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Last successful fetch; kept when a later fetch fails
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<HubError>,
    /// Whether a change subscription is currently open
    pub live: bool,
    pub generation: u64,
    /// Bumped on every applied fetch result
    pub revision: u64,
}

impl<T> Snapshot<T> {
    fn empty() -> Self {
        Self { data: None, loading: true, error: None, live: false, generation: 0, revision: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub request_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

impl LiveOptions {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            reconnect_attempts: config.realtime.reconnect_attempts,
            reconnect_delay: config.realtime.reconnect_delay(),
        }
    }
}

/// A not-yet-activated live query
pub struct LiveQuery<T> {
    changes: Arc<dyn ChangeFeed>,
    notifier: Notifier,
    options: LiveOptions,
    target: LiveTarget<T>,
    error_title: String,
}

impl<T> LiveQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(changes: Arc<dyn ChangeFeed>, notifier: Notifier, options: LiveOptions, target: LiveTarget<T>) -> Self {
        let error_title = format!("Error fetching {}", target.label);
        Self { changes, notifier, options, target, error_title }
    }

    /// Title of the notice raised when a fetch fails
    pub fn with_error_title(mut self, title: impl Into<String>) -> Self {
        self.error_title = title.into();
        self
    }

    /// Start fetching and listening. Must be called inside a tokio runtime.
    pub fn activate(self) -> LiveView<T> {
        let (state, rx) = watch::channel(Snapshot::empty());
        let mut view = LiveView {
            driver: Driver {
                state: Arc::new(state),
                generation: Arc::new(AtomicU64::new(0)),
                changes: self.changes,
                notifier: self.notifier,
                options: self.options,
                error_title: self.error_title,
            },
            rx,
            target: self.target,
            task: None,
        };
        view.start();
        view
    }
}

struct Driver<T> {
    state: Arc<watch::Sender<Snapshot<T>>>,
    generation: Arc<AtomicU64>,
    changes: Arc<dyn ChangeFeed>,
    notifier: Notifier,
    options: LiveOptions,
    error_title: String,
}

impl<T> Clone for Driver<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            generation: self.generation.clone(),
            changes: self.changes.clone(),
            notifier: self.notifier.clone(),
            options: self.options.clone(),
            error_title: self.error_title.clone(),
        }
    }
}

impl<T> Driver<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply `change` only while `generation` is still the active one
    fn update(&self, generation: u64, change: impl FnOnce(&mut Snapshot<T>)) -> bool {
        self.state.send_if_modified(|snapshot| {
            if !self.is_current(generation) {
                return false;
            }
            change(snapshot);
            true
        })
    }

    async fn refresh(&self, generation: u64, fetcher: &Fetcher<T>) {
        let result = match tokio::time::timeout(self.options.request_timeout, fetcher()).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout(format!(
                "fetch timed out after {:?}",
                self.options.request_timeout
            ))),
        };
        if !self.is_current(generation) {
            tracing::debug!("Discarding fetch result from superseded generation {}", generation);
            return;
        }

        match result {
            Ok(data) => {
                self.update(generation, |snapshot| {
                    snapshot.data = Some(data);
                    snapshot.error = None;
                    snapshot.loading = false;
                    snapshot.revision += 1;
                });
            }
            Err(e) => {
                tracing::warn!("Live fetch failed, keeping previous snapshot: {}", e);
                let applied = self.update(generation, |snapshot| {
                    snapshot.error = Some(e.clone());
                    snapshot.loading = false;
                });
                if applied {
                    self.notifier.failure(self.error_title.clone(), &e);
                }
            }
        }
    }

    async fn open(&self, generation: u64, scopes: &[ChangeScope]) -> Result<ChangeSubscription, BackendError> {
        let subscription = bounded(self.options.request_timeout, self.changes.subscribe(scopes)).await?;
        tracing::debug!("Opened change subscription '{}'", subscription.label());
        self.update(generation, |snapshot| snapshot.live = true);
        Ok(subscription)
    }

    async fn run(self, generation: u64, target: LiveTarget<T>) {
        // Subscribe before the initial fetch so no change falls between the two
        let mut subscription = match self.open(generation, &target.scopes).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!("Change subscription for {} failed: {}", target.label, e);
                None
            }
        };
        self.refresh(generation, &target.fetcher).await;

        let mut attempts_left = self.options.reconnect_attempts;
        loop {
            let failure = match subscription.as_mut() {
                Some(active) => match active.next().await {
                    Some(Ok(event)) => {
                        tracing::debug!("{:?} on {} for {}", event.kind, event.table, target.label);
                        let pending_failure = drain_queued(active);
                        self.refresh(generation, &target.fetcher).await;
                        match pending_failure {
                            Some(e) => e,
                            None => continue,
                        }
                    }
                    Some(Err(e)) => e,
                    None => BackendError::Subscription("change feed closed".to_string()),
                },
                None => BackendError::Subscription("no change subscription".to_string()),
            };

            if let Some(dead) = subscription.take() {
                dead.release();
            }
            self.update(generation, |snapshot| snapshot.live = false);

            if attempts_left == 0 {
                tracing::warn!("Live updates for {} stopped: {}", target.label, failure);
                self.notifier.notify(
                    Notice::error("Live updates unavailable")
                        .with_description(format!("{} will not refresh automatically", target.label)),
                );
                return;
            }
            attempts_left -= 1;
            tracing::info!("Reconnecting change subscription for {} after: {}", target.label, failure);
            tokio::time::sleep(self.options.reconnect_delay).await;

            match self.open(generation, &target.scopes).await {
                Ok(reopened) => {
                    subscription = Some(reopened);
                    attempts_left = self.options.reconnect_attempts;
                    // Changes may have happened while disconnected
                    self.refresh(generation, &target.fetcher).await;
                }
                Err(e) => {
                    tracing::warn!("Reconnect for {} failed: {}", target.label, e);
                }
            }
        }
    }
}

/// Swallow notifications already queued; one refetch covers them all.
/// A queued terminal error is handed back.
fn drain_queued(subscription: &mut ChangeSubscription) -> Option<BackendError> {
    let mut coalesced = 0;
    while let Some(queued) = subscription.try_next() {
        match queued {
            Ok(_) => coalesced += 1,
            Err(e) => return Some(e),
        }
    }
    if coalesced > 0 {
        tracing::debug!("Coalesced {} queued notifications", coalesced);
    }
    None
}

/// An activated live query owned by one view
pub struct LiveView<T> {
    driver: Driver<T>,
    rx: watch::Receiver<Snapshot<T>>,
    target: LiveTarget<T>,
    task: Option<JoinHandle<()>>,
}

impl<T> LiveView<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn start(&mut self) {
        let generation = self.driver.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.driver.state.send_modify(|snapshot| {
            snapshot.generation = generation;
            snapshot.loading = true;
            snapshot.live = false;
        });
        tracing::debug!("Activating live query {} (generation {})", self.target.label, generation);
        let driver = self.driver.clone();
        self.task = Some(tokio::spawn(driver.run(generation, self.target.clone())));
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.driver.state.subscribe()
    }

    /// Next snapshot change; `None` once the view is gone
    pub async fn changed(&mut self) -> Option<Snapshot<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub async fn wait_for(&mut self, predicate: impl FnMut(&Snapshot<T>) -> bool) -> Option<Snapshot<T>> {
        self.rx.wait_for(predicate).await.ok().map(|s| s.clone())
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    pub fn scopes(&self) -> &[ChangeScope] {
        &self.target.scopes
    }

    /// Refetch now, outside of any notification
    pub async fn refresh(&self) {
        if self.task.is_none() {
            return;
        }
        let generation = self.driver.generation.load(Ordering::SeqCst);
        self.driver.refresh(generation, &self.target.fetcher).await;
    }

    /// Release the subscription and stop applying results. Returns once the
    /// driver has fully stopped; calling it again is a no-op.
    pub async fn deactivate(&mut self) {
        self.driver.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            self.driver.state.send_modify(|snapshot| {
                snapshot.live = false;
                snapshot.loading = false;
            });
            tracing::debug!("Deactivated live query {}", self.target.label);
        }
    }

    /// Point the view at a new target. The old subscription is released before the new one opens.
    pub async fn retarget(&mut self, target: LiveTarget<T>) {
        self.deactivate().await;
        self.target = target;
        self.start();
    }
}

impl<T> Drop for LiveView<T> {
    fn drop(&mut self) {
        self.driver.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::types::Table;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_target(backend: &InMemoryBackend, calls: Arc<AtomicUsize>) -> LiveTarget<usize> {
        let data: Arc<dyn DataApi> = Arc::new(backend.clone());
        LiveTarget::new("apps", vec![ChangeScope::table(Table::Apps)], move || {
            let data = data.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let rows = data
                    .select(&Query::table(Table::Apps))
                    .await
                    .map_err(HubError::data_fetch)?;
                Ok(rows.len())
            }
        })
    }

    #[tokio::test]
    async fn notification_triggers_full_refetch() {
        let backend = InMemoryBackend::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = LiveQuery::new(
            Arc::new(backend.clone()),
            Notifier::new(),
            LiveOptions::default(),
            counting_target(&backend, calls.clone()),
        );
        let mut view = query.activate();
        view.wait_for(|s| !s.loading && s.live).await.unwrap();
        assert_eq!(view.snapshot().data, Some(0));

        backend.seed(Table::Apps, json!({ "id": "a", "name": "A" })).await;
        let snapshot = view.wait_for(|s| s.data == Some(1)).await.unwrap();
        assert_eq!(snapshot.revision, 2);
        assert!(calls.load(Ordering::SeqCst) >= 2);

        view.deactivate().await;
        assert_eq!(backend.open_channels(), 0);
    }

    #[tokio::test]
    async fn failed_refetch_keeps_previous_snapshot() {
        let backend = InMemoryBackend::new();
        backend.seed(Table::Apps, json!({ "id": "a", "name": "A" })).await;
        let notifier = Notifier::new();
        let mut notices = notifier.subscribe();
        let query = LiveQuery::new(
            Arc::new(backend.clone()),
            notifier,
            LiveOptions::default(),
            counting_target(&backend, Arc::new(AtomicUsize::new(0))),
        )
        .with_error_title("Error fetching apps");
        let mut view = query.activate();
        view.wait_for(|s| s.data == Some(1) && s.live).await.unwrap();

        backend.fail_next_selects(1);
        backend.seed(Table::Apps, json!({ "id": "b", "name": "B" })).await;
        let snapshot = view.wait_for(|s| s.error.is_some()).await.unwrap();
        assert_eq!(snapshot.data, Some(1));
        assert!(matches!(snapshot.error, Some(HubError::DataFetch(_))));
        assert_eq!(notices.recv().await.unwrap().title, "Error fetching apps");
    }
}
