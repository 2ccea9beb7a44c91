//! Where classifier definitions come from.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::Classifier;
use kube::api::{Api, ListParams};

/// Source of classifier definitions.
#[async_trait]
pub trait ClassifierSource: Send + Sync {
    /// Lists every classifier currently defined.
    async fn list_classifiers(&self) -> Result<Vec<Classifier>, ControllerError>;
}

#[async_trait]
impl ClassifierSource for Api<Classifier> {
    async fn list_classifiers(&self) -> Result<Vec<Classifier>, ControllerError> {
        let list = self
            .list(&ListParams::default())
            .await
            .map_err(|e| ControllerError::List(format!("listing classifiers: {e}")))?;
        Ok(list.items)
    }
}
