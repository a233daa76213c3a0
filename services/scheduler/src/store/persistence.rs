//! Write-behind persistence seam for the model catalog.
//!
//! The store calls a [`Persistence`] implementation after each catalog
//! change. Failures are logged by the store and never fail the mutation.

use super::error::StoreResult;
use super::model::ModelSnapshot;

/// Durable sink for model records.
pub trait Persistence: Send + Sync {
    /// Saves the current record for a model, replacing any previous one.
    fn save_model(&self, model: &ModelSnapshot) -> StoreResult<()>;

    fn delete_model(&self, name: &str) -> StoreResult<()>;

    /// Invokes `callback` once per persisted model record.
    fn restore_models(&self, callback: &mut dyn FnMut(ModelSnapshot)) -> StoreResult<()>;
}

/// Persistence that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

impl Persistence for NoopPersistence {
    fn save_model(&self, _model: &ModelSnapshot) -> StoreResult<()> {
        Ok(())
    }

    fn delete_model(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }

    fn restore_models(&self, _callback: &mut dyn FnMut(ModelSnapshot)) -> StoreResult<()> {
        Ok(())
    }
}
