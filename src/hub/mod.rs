// Application root: builds every service once from (config, backend) and owns their lifecycle.

use crate::backend::Backend;
use crate::catalog::{CatalogService, ReviewService, ServiceContext, UploadService};
use crate::config::HubConfig;
use crate::guard::{GuardWatch, Route, RouteGuard};
use crate::notify::Notifier;
use crate::session::SessionStore;
use crate::theme::ThemeStore;
use crate::types::AuthSnapshot;

#[derive(Clone)]
pub struct Hub {
    pub config: HubConfig,
    pub backend: Backend,
    pub notifier: Notifier,
    pub session: SessionStore,
    pub theme: ThemeStore,
    pub guard: RouteGuard,
    pub catalog: CatalogService,
    pub reviews: ReviewService,
    pub uploads: UploadService,
}

impl Hub {
    pub fn new(config: HubConfig, backend: Backend) -> Self {
        let notifier = Notifier::new();
        let session = SessionStore::new(
            backend.auth.clone(),
            backend.data.clone(),
            notifier.clone(),
            config.request_timeout(),
        );
        let ctx = ServiceContext::new(&config, backend.clone(), session.clone(), notifier.clone());

        Self {
            theme: ThemeStore::load(&config.client_dir),
            guard: RouteGuard::from_config(&config.routes),
            catalog: CatalogService::new(ctx.clone()),
            reviews: ReviewService::new(ctx.clone()),
            uploads: UploadService::new(ctx),
            config,
            backend,
            notifier,
            session,
        }
    }

    /// Restore the persisted session and begin following auth changes
    pub async fn start(&self) {
        tracing::info!("Starting hub ({:?})", self.config.environment);
        self.session.start().await;
    }

    /// Resolve once the session is restored and privilege is known for it
    pub async fn settled(&self) -> AuthSnapshot {
        self.session.wait_for(|s| !s.loading && s.privilege_resolved()).await
    }

    /// Guard decision stream for a mounted view
    pub fn guard_route(&self, route: Route) -> GuardWatch {
        self.guard.watch(self.session.subscribe(), route)
    }

    pub fn shutdown(&self) {
        self.session.shutdown();
        tracing::info!("Hub shut down");
    }
}
