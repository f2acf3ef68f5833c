//! Applies state machine transitions and their route side effects

use std::sync::Arc;

use tracing::info;

use crate::deploy::fsm::{AppEvent, AppFsm};
use crate::errors::EngineError;
use crate::models::app::App;
use crate::routes::RouteSyncer;
use crate::storage::store::StateStore;

pub struct Lifecycle {
    store: Arc<dyn StateStore>,
    routes: Arc<RouteSyncer>,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn StateStore>, routes: Arc<RouteSyncer>) -> Self {
        Self { store, routes }
    }

    /// Move the app through one transition. Routes are removed when the app
    /// leaves `running` and pushed when it enters it; push failures only warn.
    pub async fn apply(&self, app: &App, event: AppEvent) -> Result<App, EngineError> {
        let transition = AppFsm::transition(app.status, &event)?;
        self.store.apply_transition(&app.id, &transition)?;

        match event.reason() {
            Some(reason) => info!(
                "{}: {} -> {} ({}): {}",
                app.name,
                transition.from(),
                transition.to(),
                transition.event(),
                reason
            ),
            None => info!(
                "{}: {} -> {} ({})",
                app.name,
                transition.from(),
                transition.to(),
                transition.event()
            ),
        }

        if transition.leaves_running() {
            self.routes.remove(&app.name).await;
        }

        let updated = self
            .store
            .get_app_by_id(&app.id)?
            .ok_or_else(|| EngineError::NotFound(format!("App '{}'", app.name)))?;

        if transition.enters_running() {
            self.routes.sync(&updated).await;
        }

        Ok(updated)
    }
}
