use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use texflow_core::{Credits, ModelId};

/// Catalog entry for one recognition model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: ModelId,
    pub name: String,
    /// Cost charged per successful recognition.
    pub credit_cost: Credits,
    /// Inactive models are rejected at task admission.
    pub active: bool,
}

/// Catalog lookup error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown model: {0}")]
    Unknown(ModelId),
}

/// Read access to the model catalog.
pub trait ModelCatalog: Send + Sync {
    /// Look up a model by id.
    fn get(&self, model_id: ModelId) -> Option<ModelInfo>;

    /// Credit cost for one recognition with the given model.
    fn credit_cost(&self, model_id: ModelId) -> Result<Credits, CatalogError> {
        self.get(model_id)
            .map(|m| m.credit_cost)
            .ok_or(CatalogError::Unknown(model_id))
    }
}

impl<C> ModelCatalog for Arc<C>
where
    C: ModelCatalog + ?Sized,
{
    fn get(&self, model_id: ModelId) -> Option<ModelInfo> {
        (**self).get(model_id)
    }
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryModelCatalog {
    models: RwLock<HashMap<ModelId, ModelInfo>>,
}

impl InMemoryModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active model, returning its id.
    pub fn register(&self, name: impl Into<String>, credit_cost: Credits) -> ModelId {
        let id = ModelId::new();
        self.models.write().unwrap().insert(
            id,
            ModelInfo {
                id,
                name: name.into(),
                credit_cost,
                active: true,
            },
        );
        id
    }

    /// Mark a model inactive; subsequent admissions referencing it fail.
    pub fn deactivate(&self, model_id: ModelId) {
        if let Some(m) = self.models.write().unwrap().get_mut(&model_id) {
            m.active = false;
        }
    }
}

impl ModelCatalog for InMemoryModelCatalog {
    fn get(&self, model_id: ModelId) -> Option<ModelInfo> {
        self.models.read().unwrap().get(&model_id).cloned()
    }
}
