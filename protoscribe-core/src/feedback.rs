//! Service ratings from end users.

use std::sync::Arc;
use std::time::Duration;

use crate::error::bounded;
use crate::store::{FeedbackStore, StoreError};
use crate::types::Valuation;

#[derive(Clone)]
pub struct FeedbackRecorder {
    store: Arc<dyn FeedbackStore>,
    call_timeout: Duration,
}

impl FeedbackRecorder {
    pub fn new(store: Arc<dyn FeedbackStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Persist one rating and return its id.
    pub async fn record(&self, valuation: &Valuation) -> Result<i64, StoreError> {
        let id = bounded(
            self.call_timeout,
            StoreError::Timeout,
            self.store.save_valuation(valuation),
        )
        .await?;
        tracing::info!(valuation_id = id, "Feedback stored");
        Ok(id)
    }
}
