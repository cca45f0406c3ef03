//! Model bundles written by SAVE MODELS and read by LOAD MODELS

use std::path::Path;

use bql_model::LatentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::btable::Btable;
use crate::error::EngineError;

pub const BUNDLE_FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBundle {
    pub format: u32,
    pub btable: String,
    /// Schema fingerprint of the btable the models were fit to.
    pub fingerprint: String,
    pub saved_at: DateTime<Utc>,
    pub models: Vec<BundledModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledModel {
    pub id: usize,
    pub state: LatentState,
}

impl ModelBundle {
    pub fn from_btable(btable: &Btable) -> Result<Self, EngineError> {
        Ok(Self {
            format: BUNDLE_FORMAT,
            btable: btable.name.clone(),
            fingerprint: btable.fingerprint()?,
            saved_at: Utc::now(),
            models: btable
                .models
                .iter()
                .map(|(id, record)| BundledModel {
                    id: *id,
                    state: record.state.clone(),
                })
                .collect(),
        })
    }

    pub fn read(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::file(path, e))?;
        let bundle: Self = serde_json::from_str(&text)?;
        if bundle.format != BUNDLE_FORMAT {
            return Err(EngineError::InvalidQuery(format!(
                "unsupported model bundle format {} in {}",
                bundle.format,
                path.display()
            )));
        }
        Ok(bundle)
    }

    pub fn write(&self, path: &Path) -> Result<(), EngineError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|e| EngineError::file(path, e))
    }

    /// Check the bundle against `btable` and return its states in id order.
    pub fn into_states(self, btable: &Btable) -> Result<Vec<LatentState>, EngineError> {
        let expected = btable.fingerprint()?;
        if self.fingerprint != expected {
            return Err(EngineError::SchemaMismatch {
                btable: btable.name.clone(),
                reason: format!("bundle was saved from {} with a different schema", self.btable),
            });
        }
        let data = btable.dataset()?;
        let mut models = self.models;
        models.sort_by_key(|m| m.id);
        models
            .into_iter()
            .map(|m| {
                m.state.validate(&data)?;
                Ok::<_, EngineError>(m.state)
            })
            .collect()
    }
}
