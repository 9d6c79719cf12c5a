use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{describe, Activity, InFlight, Outcome};
use crate::api::Backend;
use crate::model::{self, Crop, CropUpdate, Id, NewCrop};

#[derive(Default)]
struct CropState {
    items: Vec<Crop>,
    current: Option<Crop>,
    error: Option<String>,
}

pub struct CropRepository {
    backend: Arc<dyn Backend>,
    state: RwLock<CropState>,
    list_guard: InFlight,
    writes: Activity,
}

impl CropRepository {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: RwLock::new(CropState::default()),
            list_guard: InFlight::default(),
            writes: Activity::default(),
        }
    }

    // ----------------------------
    // Read model
    // ----------------------------

    pub async fn items(&self) -> Vec<Crop> {
        self.state.read().await.items.clone()
    }

    pub async fn current(&self) -> Option<Crop> {
        self.state.read().await.current.clone()
    }

    pub async fn find(&self, id: Id) -> Option<Crop> {
        self.state.read().await.items.iter().find(|c| c.id == id).cloned()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.list_guard.is_active() || self.writes.is_active()
    }

    async fn fail(&self, message: String) {
        self.state.write().await.error = Some(message);
    }

    // ----------------------------
    // Operations
    // ----------------------------

    /// Fetch every crop.  A call made while one is outstanding returns the
    /// cached list without touching the network.
    pub async fn list(&self) -> Vec<Crop> {
        let Some(_guard) = self.list_guard.try_begin() else {
            debug!("crop list already in flight");
            return self.items().await;
        };

        match self.backend.list_crops().await {
            Ok(res) => {
                let mut st = self.state.write().await;
                st.items = res.data;
                st.error = None;
                debug!(count = st.items.len(), "crops loaded");
                st.items.clone()
            }
            Err(e) => {
                self.fail(describe("crops", "cargar los cultivos", &e)).await;
                self.items().await
            }
        }
    }

    pub async fn get_by_id(&self, id: Id) -> Option<Crop> {
        let _busy = self.writes.begin();
        match self.backend.get_crop(id).await {
            Ok(res) => {
                let mut st = self.state.write().await;
                model::upsert(&mut st.items, res.data.clone());
                st.current = Some(res.data.clone());
                Some(res.data)
            }
            Err(e) => {
                self.fail(describe("crops", &format!("obtener el cultivo {id}"), &e))
                    .await;
                None
            }
        }
    }

    pub async fn create(&self, data: &NewCrop) -> Option<Crop> {
        let _busy = self.writes.begin();
        match self.backend.create_crop(data).await {
            Ok(res) => {
                info!(crop = res.data.id, name = %res.data.name, "crop created");
                let mut st = self.state.write().await;
                model::upsert(&mut st.items, res.data.clone());
                Some(res.data)
            }
            Err(e) => {
                self.fail(describe("crops", "crear el cultivo", &e)).await;
                None
            }
        }
    }

    pub async fn update(&self, id: Id, data: &CropUpdate) -> Option<Crop> {
        let _busy = self.writes.begin();
        match self.backend.update_crop(id, data).await {
            Ok(res) => {
                let mut st = self.state.write().await;
                model::upsert(&mut st.items, res.data.clone());
                if st.current.as_ref().is_some_and(|c| c.id == id) {
                    st.current = Some(res.data.clone());
                }
                Some(res.data)
            }
            Err(e) => {
                self.fail(describe("crops", &format!("actualizar el cultivo {id}"), &e))
                    .await;
                None
            }
        }
    }

    pub async fn delete(&self, id: Id) -> Outcome {
        let _busy = self.writes.begin();
        match self.backend.delete_crop(id).await {
            Ok(res) => {
                info!(crop = id, "crop deleted");
                let mut st = self.state.write().await;
                model::remove(&mut st.items, id);
                if st.current.as_ref().is_some_and(|c| c.id == id) {
                    st.current = None;
                }
                Outcome::ok(res.message)
            }
            Err(e) => {
                let message = describe("crops", &format!("eliminar el cultivo {id}"), &e);
                self.fail(message.clone()).await;
                Outcome::failed(message)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
