//! Reading repository.  Readings are immutable: there is no update, and
//! deletes are not exposed by the backend.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{describe, Activity, InFlight};
use crate::api::{Backend, HistoryQuery};
use crate::model::{Id, NewReading, Reading};

#[derive(Default)]
struct ReadingState {
    items: Vec<Reading>,
    crop_id: Option<Id>,
    current: Option<Reading>,
    error: Option<String>,
}

pub struct ReadingRepository {
    backend: Arc<dyn Backend>,
    state: RwLock<ReadingState>,
    by_crop_guard: InFlight,
    writes: Activity,
}

impl ReadingRepository {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: RwLock::new(ReadingState::default()),
            by_crop_guard: InFlight::default(),
            writes: Activity::default(),
        }
    }

    pub async fn items(&self) -> Vec<Reading> {
        self.state.read().await.items.clone()
    }

    pub async fn current(&self) -> Option<Reading> {
        self.state.read().await.current.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.by_crop_guard.is_active() || self.writes.is_active()
    }

    async fn fail(&self, message: String) {
        self.state.write().await.error = Some(message);
    }

    /// Load every reading of a crop into the repository list.
    pub async fn list_by_crop(&self, crop_id: Id) -> Vec<Reading> {
        let Some(_guard) = self.by_crop_guard.try_begin() else {
            debug!(crop = crop_id, "reading list already in flight");
            return self.items().await;
        };
        match self.backend.list_readings_by_crop(crop_id).await {
            Ok(res) => {
                let mut st = self.state.write().await;
                st.items = res.data;
                st.crop_id = Some(crop_id);
                st.error = None;
                st.items.clone()
            }
            Err(e) => {
                self.fail(describe(
                    "readings",
                    &format!("cargar las lecturas del cultivo {crop_id}"),
                    &e,
                ))
                .await;
                self.items().await
            }
        }
    }

    /// Unguarded, stateless crop listing.  Errors come back as messages.
    pub async fn fetch_by_crop(&self, crop_id: Id) -> Result<Vec<Reading>, String> {
        self.backend
            .list_readings_by_crop(crop_id)
            .await
            .map(|res| res.data)
            .map_err(|e| {
                describe(
                    "readings",
                    &format!("obtener las lecturas del cultivo {crop_id}"),
                    &e,
                )
            })
    }

    /// Windowed history for one sensor.  Does not touch repository state;
    /// the caller owns error reporting (the polling coordinator records it
    /// as its own error).
    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<Reading>, String> {
        self.backend
            .reading_history(query)
            .await
            .map(|res| res.data)
            .map_err(|e| {
                describe(
                    "readings",
                    &format!("obtener el historial del sensor {}", query.sensor_id),
                    &e,
                )
            })
    }

    pub async fn get_by_id(&self, id: Id) -> Option<Reading> {
        let _busy = self.writes.begin();
        match self.backend.get_reading(id).await {
            Ok(res) => {
                self.state.write().await.current = Some(res.data.clone());
                Some(res.data)
            }
            Err(e) => {
                self.fail(describe("readings", &format!("obtener la lectura {id}"), &e))
                    .await;
                None
            }
        }
    }

    pub async fn create(&self, data: &NewReading) -> Option<Reading> {
        let _busy = self.writes.begin();
        match self.backend.create_reading(data).await {
            Ok(res) => {
                self.absorb(std::slice::from_ref(&res.data)).await;
                Some(res.data)
            }
            Err(e) => {
                self.fail(describe("readings", "registrar la lectura", &e)).await;
                None
            }
        }
    }

    pub async fn create_batch(&self, data: &[NewReading]) -> Option<Vec<Reading>> {
        if data.is_empty() {
            return Some(Vec::new());
        }
        let _busy = self.writes.begin();
        match self.backend.create_readings_batch(data).await {
            Ok(res) => {
                info!(count = res.data.len(), "reading batch ingested");
                self.absorb(&res.data).await;
                Some(res.data)
            }
            Err(e) => {
                self.fail(describe("readings", "registrar el lote de lecturas", &e))
                    .await;
                None
            }
        }
    }

    /// Append server-created readings that belong to the loaded crop.
    async fn absorb(&self, created: &[Reading]) {
        let mut st = self.state.write().await;
        let loaded = st.crop_id;
        st.items.extend(
            created
                .iter()
                .filter(|r| loaded.is_none() || r.crop_id == loaded)
                .cloned(),
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{self, FakeBackend};
    use time::macros::datetime;

    fn repo_with(backend: FakeBackend) -> (Arc<FakeBackend>, ReadingRepository) {
        let backend = Arc::new(backend);
        let repo = ReadingRepository::new(backend.clone());
        (backend, repo)
    }

    fn new_reading(crop_id: Id, value: f64) -> NewReading {
        NewReading {
            sensor_id: 1,
            crop_id,
            value,
            note: None,
            timestamp: Some(datetime!(2024-05-01 10:00 UTC)),
        }
    }

    #[tokio::test]
    async fn batch_ingestion_appends_server_readings_for_loaded_crop() {
        let (_backend, repo) = repo_with(FakeBackend::new());
        repo.list_by_crop(1).await;

        let created = repo
            .create_batch(&[new_reading(1, 20.0), new_reading(2, 21.0)])
            .await
            .unwrap();

        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|r| r.id.is_some()));
        let items = repo.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value, 20.0);
    }

    #[tokio::test]
    async fn empty_batch_skips_network() {
        let (backend, repo) = repo_with(FakeBackend::new());
        assert_eq!(repo.create_batch(&[]).await, Some(Vec::new()));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn history_errors_do_not_touch_repository_state() {
        let (backend, repo) = repo_with(FakeBackend::new());
        backend.fail("history:3");

        let query = HistoryQuery {
            crop_id: 1,
            sensor_id: 3,
            start: datetime!(2024-05-01 09:00 UTC),
            end: datetime!(2024-05-01 10:00 UTC),
            limit: 100,
        };
        let err = repo.history(&query).await.unwrap_err();

        assert!(err.contains("sensor 3"), "{err}");
        assert_eq!(repo.error().await, None);
    }

    #[tokio::test]
    async fn create_failure_records_error() {
        let (backend, repo) = repo_with(
            FakeBackend::new().with_reading(fake::reading(1, 1, 19.0, datetime!(2024-05-01 08:00 UTC))),
        );
        repo.list_by_crop(1).await;
        backend.fail("create_reading");

        assert_eq!(repo.create(&new_reading(1, 22.0)).await, None);
        assert_eq!(repo.items().await.len(), 1);
        assert!(repo.error().await.unwrap().contains("registrar la lectura"));
    }
}
