//! Alert repository.  Alerts are created by the backend when a reading
//! crosses a threshold; clients only list them and delete (resolve) them.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{describe, Activity, InFlight, Outcome};
use crate::api::Backend;
use crate::model::{self, Alert, AlertLevel, Id};

#[derive(Default)]
struct AlertState {
    items: Vec<Alert>,
    current: Option<Alert>,
    error: Option<String>,
}

pub struct AlertRepository {
    backend: Arc<dyn Backend>,
    state: RwLock<AlertState>,
    mine_guard: InFlight,
    by_crop_guard: InFlight,
    writes: Activity,
}

impl AlertRepository {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: RwLock::new(AlertState::default()),
            mine_guard: InFlight::default(),
            by_crop_guard: InFlight::default(),
            writes: Activity::default(),
        }
    }

    pub async fn items(&self) -> Vec<Alert> {
        self.state.read().await.items.clone()
    }

    pub async fn current(&self) -> Option<Alert> {
        self.state.read().await.current.clone()
    }

    pub async fn unresolved_count(&self, level: AlertLevel) -> usize {
        self.state
            .read()
            .await
            .items
            .iter()
            .filter(|a| !a.resolved && a.level == level)
            .count()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.mine_guard.is_active() || self.by_crop_guard.is_active() || self.writes.is_active()
    }

    async fn fail(&self, message: String) {
        self.state.write().await.error = Some(message);
    }

    async fn replace(&self, alerts: Vec<Alert>) -> Vec<Alert> {
        let mut st = self.state.write().await;
        st.items = alerts;
        st.error = None;
        st.items.clone()
    }

    pub async fn list_mine(&self) -> Vec<Alert> {
        let Some(_guard) = self.mine_guard.try_begin() else {
            debug!("alert list already in flight");
            return self.items().await;
        };
        match self.backend.list_my_alerts().await {
            Ok(res) => self.replace(res.data).await,
            Err(e) => {
                self.fail(describe("alerts", "cargar las alertas", &e)).await;
                self.items().await
            }
        }
    }

    pub async fn list_by_crop(&self, crop_id: Id) -> Vec<Alert> {
        let Some(_guard) = self.by_crop_guard.try_begin() else {
            debug!(crop = crop_id, "crop alert list already in flight");
            return self.items().await;
        };
        match self.backend.list_alerts_by_crop(crop_id).await {
            Ok(res) => self.replace(res.data).await,
            Err(e) => {
                self.fail(describe(
                    "alerts",
                    &format!("cargar las alertas del cultivo {crop_id}"),
                    &e,
                ))
                .await;
                self.items().await
            }
        }
    }

    pub async fn get_by_id(&self, id: Id) -> Option<Alert> {
        let _busy = self.writes.begin();
        match self.backend.get_alert(id).await {
            Ok(res) => {
                let mut st = self.state.write().await;
                st.current = Some(res.data.clone());
                model::upsert(&mut st.items, res.data.clone());
                Some(res.data)
            }
            Err(e) => {
                self.fail(describe("alerts", &format!("obtener la alerta {id}"), &e))
                    .await;
                None
            }
        }
    }

    /// Resolve an alert by deleting it.
    pub async fn delete(&self, id: Id) -> Outcome {
        let _busy = self.writes.begin();
        match self.backend.delete_alert(id).await {
            Ok(res) => {
                info!(alert = id, "alert resolved");
                let mut st = self.state.write().await;
                model::remove(&mut st.items, id);
                if st.current.as_ref().is_some_and(|a| a.id == id) {
                    st.current = None;
                }
                Outcome::ok(res.message)
            }
            Err(e) => {
                let message = describe("alerts", &format!("eliminar la alerta {id}"), &e);
                self.fail(message.clone()).await;
                Outcome::failed(message)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{self, FakeBackend};

    fn repo_with(backend: FakeBackend) -> (Arc<FakeBackend>, AlertRepository) {
        let backend = Arc::new(backend);
        let repo = AlertRepository::new(backend.clone());
        (backend, repo)
    }

    #[tokio::test]
    async fn crop_listing_filters_and_counts() {
        let (_backend, repo) = repo_with(
            FakeBackend::new()
                .with_alert(fake::alert(1, 7, AlertLevel::Critical))
                .with_alert(fake::alert(2, 7, AlertLevel::Warning))
                .with_alert(fake::alert(3, 8, AlertLevel::Critical)),
        );

        let alerts = repo.list_by_crop(7).await;

        assert_eq!(alerts.len(), 2);
        assert_eq!(repo.unresolved_count(AlertLevel::Critical).await, 1);
    }

    #[tokio::test]
    async fn mine_and_by_crop_guards_are_independent() {
        let (backend, repo) = repo_with(FakeBackend::new().with_alert(fake::alert(1, 7, AlertLevel::Info)));

        tokio::join!(repo.list_mine(), repo.list_mine(), repo.list_by_crop(7));

        assert_eq!(backend.call_count("list_my_alerts"), 1);
        assert_eq!(backend.call_count("list_alerts_by_crop:7"), 1);
    }

    #[tokio::test]
    async fn delete_resolves_locally_with_server_message() {
        let (_backend, repo) = repo_with(FakeBackend::new().with_alert(fake::alert(1, 7, AlertLevel::Info)));
        repo.list_mine().await;

        let outcome = repo.delete(1).await;

        assert_eq!(outcome, Outcome::ok(Some("Alerta resuelta".into())));
        assert!(repo.items().await.is_empty());
    }

    #[tokio::test]
    async fn delete_of_missing_alert_keeps_list() {
        let (_backend, repo) = repo_with(FakeBackend::new().with_alert(fake::alert(1, 7, AlertLevel::Info)));
        repo.list_mine().await;

        let outcome = repo.delete(99).await;

        assert!(!outcome.success);
        assert_eq!(repo.items().await.len(), 1);
    }
}
